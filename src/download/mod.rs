//! Attachment downloads: naming, collision avoidance, and writing bytes.

pub mod attachment;
pub mod filename;

pub use attachment::{download_all, download_attachment, DownloadAllReport, SavedAttachment};
pub use filename::{create_batch_dir, message_folder_name, sanitize_filename, unique_path};
