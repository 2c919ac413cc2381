mod bus;
mod types;

pub use bus::{EventBus, EventReceiver, SubscriptionId};
pub use types::{EventKind, EventPayload, EventSequence, UploadEvent};
