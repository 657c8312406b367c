pub(crate) mod batcher;
pub(crate) mod channel;
pub(crate) mod event;

pub(crate) use batcher::Batcher;
pub(crate) use channel::Channel;
