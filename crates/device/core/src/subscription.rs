//! Listener bookkeeping and the message subscription handle.
//!
//! Listeners are unbounded mpsc senders keyed by a per-set id. Handles remove
//! themselves from their set, either explicitly through `unsubscribe()` or on
//! drop. Removing the last listener of a feature disables that feature on the
//! transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{context::ClientContext, error::ClientError, message::Message, state::Feature};

/// Ordered set of listeners for one event stream.
#[derive(Debug)]
pub(crate) struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<T: Clone> ListenerSet<T> {
    pub fn add(&mut self, sender: mpsc::UnboundedSender<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, sender));
        id
    }

    /// Removes listener `id`. Returns true when it was present.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Delivers `value` to every listener, pruning closed ones.
    /// Returns the number of listeners reached.
    pub fn send(&mut self, value: &T) -> usize {
        self.entries
            .retain(|(_, sender)| sender.send(value.clone()).is_ok());
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every sender; the matching receivers observe end of stream.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Stream of cloud-to-device messages.
///
/// The first live subscription enables C2D on the transport; releasing the
/// last one disables it. The stream ends when the client is closed.
#[derive(Debug)]
pub struct MessageSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    ctx: Arc<ClientContext>,
    released: bool,
}

impl MessageSubscription {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::UnboundedReceiver<Message>,
        ctx: Arc<ClientContext>,
    ) -> Self {
        Self {
            id,
            rx,
            ctx,
            released: false,
        }
    }

    /// Waits for the next message. Returns `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Releases the subscription and, if it was the last one, disables C2D
    /// before returning.
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        self.released = true;
        if self.ctx.remove_message_listener(self.id) {
            debug!("Last message subscription released");
            return self.ctx.release_feature(Feature::C2d).await;
        }
        Ok(())
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.ctx.remove_message_listener(self.id) {
            debug!("Last message subscription dropped");
            if !self.ctx.spawn_release(Feature::C2d) {
                warn!("No runtime available to disable C2D after the last subscription dropped");
            }
        }
    }
}
