//! Bidirectional channels built from two headers.
//!
//! The creator formats two regions, `tether-{name}-out` and
//! `tether-{name}-in`, and sends on the first. The opener attaches to the
//! same pair with the directions swapped, so each side sends on what the
//! other receives on.

use std::sync::Arc;

use tether_sync::{Handle, Semaphore, Timeout, WaitObject};
use tracing::info;

use crate::config::ChannelConfig;
use crate::header::{Header, SendStatus};
use crate::message::Message;
use crate::shm::SharedRegion;
use crate::{ChannelError, Result};

/// One end of a two-way channel.
#[derive(Debug)]
pub struct Channel {
    name: String,
    outbound: Arc<Header>,
    inbound: Arc<Header>,
}

impl Channel {
    /// Create both regions and semaphores of a named channel.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        let size = config.region_size;
        let max = Header::semaphore_max(size);

        // Semaphores exist before either region is published, so an opener
        // that sees the ready magic can always open them.
        let out_sem = Semaphore::create_named(&config.semaphore_path(true), max, 0)
            .map_err(ChannelError::from_named)?;
        let in_sem = Semaphore::create_named(&config.semaphore_path(false), max, 0)
            .map_err(ChannelError::from_named)?;

        let out_region = SharedRegion::create(&config.region_name(true), size)?;
        let in_region = SharedRegion::create(&config.region_name(false), size)?;

        let outbound = Header::format(out_region.into(), out_sem)?;
        let inbound = Header::format(in_region.into(), in_sem)?;

        info!("Created channel {} ({size} bytes per direction)", config.name);
        Ok(Self {
            name: config.name.clone(),
            outbound: Arc::new(outbound),
            inbound: Arc::new(inbound),
        })
    }

    /// Attach to a channel another process created.
    ///
    /// Waits for the creator per the configured retries. The region size is
    /// taken from the existing regions, not from `config`.
    pub fn open(config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        let retries = config.open_retries;
        let interval = config.open_retry_interval();

        // The creator's inbound is our outbound.
        let out_region = SharedRegion::open(&config.region_name(false), retries, interval)?;
        let in_region = SharedRegion::open(&config.region_name(true), retries, interval)?;

        let out_sem = Semaphore::open_named(
            &config.semaphore_path(false),
            Header::semaphore_max(out_region.size()),
        )
        .map_err(ChannelError::from_named)?;
        let in_sem = Semaphore::open_named(
            &config.semaphore_path(true),
            Header::semaphore_max(in_region.size()),
        )
        .map_err(ChannelError::from_named)?;

        let outbound = Header::attach(out_region.into(), out_sem)?;
        let inbound = Header::attach(in_region.into(), in_sem)?;

        info!("Opened channel {}", config.name);
        Ok(Self {
            name: config.name.clone(),
            outbound: Arc::new(outbound),
            inbound: Arc::new(inbound),
        })
    }

    /// Two connected in-process ends over heap regions.
    ///
    /// What one end sends the other receives.
    pub fn pair(size: u32) -> Result<(Self, Self)> {
        let a_to_b = Arc::new(Header::in_memory(size)?);
        let b_to_a = Arc::new(Header::in_memory(size)?);
        let a = Self {
            name: "pair-a".to_string(),
            outbound: Arc::clone(&a_to_b),
            inbound: Arc::clone(&b_to_a),
        };
        let b = Self {
            name: "pair-b".to_string(),
            outbound: b_to_a,
            inbound: a_to_b,
        };
        Ok((a, b))
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reserve an outgoing message of `len` bytes.
    pub fn allocate(&self, len: u32) -> Result<Message<'_>> {
        self.outbound.allocate(len)
    }

    /// Send a message allocated from this channel.
    pub fn send(&self, message: Message<'_>) -> Result<SendStatus> {
        self.outbound.send(message)
    }

    /// Post notifications deferred by earlier sends.
    pub fn flush(&self) -> Result<SendStatus> {
        self.outbound.flush()
    }

    /// Block until a message arrives, for at most `timeout`.
    pub fn receive(&self, timeout: Timeout) -> Result<Message<'_>> {
        self.inbound.receive(timeout)
    }

    /// Take a message if one is queued.
    pub fn try_receive(&self) -> Result<Option<Message<'_>>> {
        self.inbound.try_receive()
    }

    /// Release a received message, or an allocated one that was never sent.
    pub fn release(&self, message: &Message<'_>) -> Result<()> {
        if self.inbound.release(message)? || self.outbound.release(message)? {
            Ok(())
        } else {
            Err(ChannelError::ForeignMessage)
        }
    }

    /// Header this end receives on.
    pub fn inbound(&self) -> &Header {
        &self.inbound
    }

    /// Header this end sends on.
    pub fn outbound(&self) -> &Header {
        &self.outbound
    }
}

impl WaitObject for Channel {
    /// Signalled while inbound messages are queued.
    fn handle(&self) -> Handle {
        self.inbound.handle()
    }
}
