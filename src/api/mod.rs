//! Command facade over a modem engine
//!
//! [`Modem`] owns the engine and the event subscriber. Each facade method
//! performs exactly one engine call and hands back the engine's answer as a
//! [`modem::Result`](crate::modem::Result); nothing is retried or validated
//! here. With the `modem-trace` feature every call leaves a debug line.
//!
//! Events queued by the engine are drained on every [`Modem::run_engine`]
//! and pushed into the subscriber channel, if one is registered. A consumer
//! that must see every event regardless of channel capacity pumps through
//! [`Modem::run_engine_with`] and reads the channel after each dispatch.

/// Debug line for a modem call, compiled out without `modem-trace`
macro_rules! modem_trace {
    ($($arg:tt)*) => {
        if cfg!(feature = "modem-trace") {
            tracing::debug!(target: "lbm_node::modem", $($arg)*);
        }
    };
}

pub mod lorawan;
pub mod p2p;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::modem::{return_code, Event, ModemEngine, Result};
pub use lorawan::LoRaWan;
pub use p2p::P2p;

pub struct Modem<E: ModemEngine> {
    engine: E,
    subscriber: Option<mpsc::Sender<Event>>,
}

impl<E: ModemEngine> Modem<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            subscriber: None,
        }
    }

    /// Reset the engine into a known, initialised state
    pub fn init(&mut self) -> Result {
        let ret = self.engine.reset();
        modem_trace!("Initializing Basic Modem, result: {}", return_code(&ret));
        ret
    }

    /// Pump the engine once and dispatch every event it queued.
    ///
    /// Returns the engine's sleep hint. Must be called regularly.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn run_engine(&mut self) -> Duration {
        self.run_engine_with(|_| {})
    }

    /// Like [`Modem::run_engine`], but calls `after_dispatch` once each event
    /// has been handed to the subscriber, before the next one is taken from
    /// the engine. The callback may issue further modem commands.
    pub fn run_engine_with<F>(&mut self, mut after_dispatch: F) -> Duration
    where
        F: FnMut(&mut Self),
    {
        let sleep = self.engine.run_engine();
        while let Some(event) = self.engine.get_event() {
            self.dispatch(event);
            after_dispatch(self);
        }
        sleep
    }

    /// Register (or with `None`, clear) the event subscriber. Last call wins.
    pub fn set_event_subscriber(&mut self, subscriber: Option<mpsc::Sender<Event>>) {
        modem_trace!(
            "User event subscriber set: {}",
            if subscriber.is_some() {
                "registered"
            } else {
                "cleared"
            }
        );
        self.subscriber = subscriber;
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn has_event_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }

    pub fn lorawan(&mut self) -> LoRaWan<'_, E> {
        LoRaWan::new(&mut self.engine)
    }

    pub fn p2p(&self) -> P2p {
        P2p
    }

    fn dispatch(&self, event: Event) {
        let Some(tx) = &self.subscriber else {
            debug!("No event subscriber, dropping {}", event.kind);
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event subscriber is full, dropping {}", event.kind);
            }
            Err(TrySendError::Closed(event)) => {
                warn!("Event subscriber is gone, dropping {}", event.kind);
            }
        }
    }

    #[cfg(test)]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[cfg(test)]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}
