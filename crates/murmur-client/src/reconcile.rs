//! Phase two of an optimistic send.
//!
//! [`apply_ack`] is pure and idempotent: it only ever moves a `Pending`
//! message whose temp id matches the ack, and it mutates the message in place
//! so its position in the log never changes. Terminal transitions clear
//! `upload_progress`. Acks arriving after the message reached a terminal
//! state are no-ops.

use murmur_shared::protocol::{AckStatus, SendAck};
use murmur_shared::types::MessageId;

use crate::model::{Message, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirmed(MessageId),
    Failed,
    /// Server accepted the metadata and waits for the file frame.
    AwaitingUpload,
    Unchanged,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Confirmed(_) | Transition::Failed)
    }
}

pub fn apply_ack(message: &mut Message, ack: &SendAck) -> Transition {
    if message.status != MessageStatus::Pending || message.temp_id != Some(ack.temp_id) {
        return Transition::Unchanged;
    }

    match (ack.status, ack.id) {
        (AckStatus::AwaitingAck, _) => Transition::AwaitingUpload,
        (AckStatus::Sended, Some(id)) => {
            message.id = Some(id);
            message.status = MessageStatus::Confirmed;
            message.upload_progress = None;
            Transition::Confirmed(id)
        }
        // a success without an id cannot be reconciled
        (AckStatus::Sended, None) | (AckStatus::Error, _) => {
            message.status = MessageStatus::Failed;
            message.upload_progress = None;
            Transition::Failed
        }
    }
}
