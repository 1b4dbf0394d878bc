//! Mailbox API record types: messages, attachments, and folders.
//!
//! Records keep every field the API returned. Known fields are typed;
//! the rest ride along in `extra` so caller-selected fields survive a
//! round trip into the JSON output.

pub mod attachment;
pub mod folder;
pub mod message;

pub use attachment::Attachment;
pub use folder::MailFolder;
pub use message::Message;
