use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::pinger::Pinger;
use crate::pdu::factory::{DefaultMessageFactory, MessageFactory};
use crate::pdu::sequence::SequenceGenerator;

/// State that is shared by all channels of an application: message sequence numbers, the
///  keepalive scheduler and the message factory.
///
/// Applications typically create one environment at startup and pass clones to all channels.
///  Independent environments do not share any state, so tests can create as many as they need.
#[derive(Clone)]
pub struct ChannelEnvironment {
    pub sequence: Arc<SequenceGenerator>,
    pub pinger: Arc<Pinger>,
    pub message_factory: Arc<dyn MessageFactory>,
    channel_ids: Arc<AtomicU64>,
}

impl Debug for ChannelEnvironment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelEnvironment{{sequence:{}}}", self.sequence.current())
    }
}

impl Default for ChannelEnvironment {
    fn default() -> Self {
        ChannelEnvironment::with_message_factory(Arc::new(DefaultMessageFactory::default()))
    }
}

impl ChannelEnvironment {
    pub fn with_message_factory(message_factory: Arc<dyn MessageFactory>) -> ChannelEnvironment {
        ChannelEnvironment {
            sequence: Arc::new(SequenceGenerator::new()),
            pinger: Arc::new(Pinger::new()),
            message_factory,
            channel_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_channel_id(&self) -> u64 {
        self.channel_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}
