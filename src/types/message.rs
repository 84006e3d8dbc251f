//! The message contract.

use super::ProviderType;
use crate::errors::{SenderError, SenderResult};
use std::any::Any;
use std::fmt;

/// A provider-specific payload.
///
/// Messages are immutable once handed to the sender. Transformers recover
/// the concrete type through [`downcast_message`].
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Provider family this message is routed to
    fn provider_type(&self) -> ProviderType;

    /// Optional vendor subtype (e.g. `aliyun` for SMS)
    fn sub_type(&self) -> Option<&str> {
        None
    }

    /// Self-validation, run before any account is selected
    fn validate(&self) -> SenderResult<()>;

    /// Message identifier
    fn msg_id(&self) -> &str;

    /// Upcast for downcasting in transformers
    fn as_any(&self) -> &dyn Any;
}

/// Recover the concrete message type, or fail with a transform error.
pub fn downcast_message<M: Message>(msg: &dyn Message) -> SenderResult<&M> {
    msg.as_any().downcast_ref::<M>().ok_or_else(|| {
        SenderError::transform(format!(
            "unsupported message type for provider {}",
            msg.provider_type()
        ))
    })
}

/// Fail validation when a required string field is empty
pub(crate) fn require(value: &str, field: &str) -> SenderResult<()> {
    if value.trim().is_empty() {
        Err(SenderError::validation(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

/// Fail validation when a required list is empty
pub(crate) fn require_any<T>(values: &[T], field: &str) -> SenderResult<()> {
    if values.is_empty() {
        Err(SenderError::validation(format!(
            "at least one {} is required",
            field
        )))
    } else {
        Ok(())
    }
}
