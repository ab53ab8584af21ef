//! The requesting side of an echo run.

use std::time::{Duration, Instant};

use serde::Serialize;
use tether_channel::{Channel, ChannelError};
use tether_sync::Timeout;
use tracing::{debug, info};

use crate::{EchoError, REPLY, REQUEST, Result, WORD, read_word, write_word};

/// How long a single blocking receive waits before flushing again.
const RECEIVE_SLICE: Timeout = Timeout::Millis(50);

/// Outcome of [`run_client`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClientReport {
    /// Requests sent
    pub requests: u32,
    /// Replies received
    pub replies: u32,
    /// Sends whose notification had to be deferred
    pub deferred_sends: u32,
    /// Wall time of the whole exchange in microseconds
    pub elapsed_us: u64,
    /// Completed round trips per second
    pub round_trips_per_sec: f64,
}

/// Send `count` requests over `channel` and wait for every reply.
///
/// Replies are collected while sending, so neither direction fills up.
/// Fails with [`EchoError::ReplyTimeout`] when no reply arrives for
/// `reply_timeout`.
pub fn run_client(channel: &Channel, count: u32, reply_timeout: Duration) -> Result<ClientReport> {
    let started = Instant::now();
    let mut sent = 0;
    let mut replies = 0;
    let mut deferred_sends = 0;
    let mut last_progress = Instant::now();

    while sent < count {
        match channel.allocate(WORD) {
            Ok(mut message) => {
                write_word(&mut message, REQUEST);
                if channel.send(message)?.is_full() {
                    deferred_sends += 1;
                }
                sent += 1;
                last_progress = Instant::now();
            }
            Err(ChannelError::OutOfSpace { .. }) => {
                // Requests are freed once the echo side releases them
                channel.flush()?;
                std::thread::yield_now();
            }
            Err(e) => return Err(e.into()),
        }

        let collected = collect_replies(channel)?;
        if collected > 0 {
            replies += collected;
            last_progress = Instant::now();
        } else if last_progress.elapsed() > reply_timeout {
            return Err(EchoError::ReplyTimeout {
                received: replies,
                expected: count,
            });
        }
    }
    debug!("Sent {sent} requests, {replies} replies so far");

    while replies < count {
        channel.flush()?;
        match channel.receive(RECEIVE_SLICE) {
            Ok(message) => {
                check_reply(channel, &message)?;
                replies += 1;
                last_progress = Instant::now();
            }
            Err(e) if e.is_timeout() => {
                if last_progress.elapsed() > reply_timeout {
                    return Err(EchoError::ReplyTimeout {
                        received: replies,
                        expected: count,
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    let elapsed = started.elapsed();
    let round_trips_per_sec = if elapsed.is_zero() {
        0.0
    } else {
        f64::from(replies) / elapsed.as_secs_f64()
    };
    info!(
        "Completed {replies} round trips in {:.3}s ({round_trips_per_sec:.0}/s)",
        elapsed.as_secs_f64()
    );

    Ok(ClientReport {
        requests: sent,
        replies,
        deferred_sends,
        elapsed_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        round_trips_per_sec,
    })
}

fn collect_replies(channel: &Channel) -> Result<u32> {
    let mut collected = 0;
    while let Some(message) = channel.try_receive()? {
        check_reply(channel, &message)?;
        collected += 1;
    }
    Ok(collected)
}

fn check_reply(channel: &Channel, message: &tether_channel::Message<'_>) -> Result<()> {
    let word = read_word(message);
    channel.release(message)?;
    if word == Some(REPLY) {
        Ok(())
    } else {
        Err(EchoError::UnexpectedPayload {
            expected: REPLY,
            found: word,
        })
    }
}
