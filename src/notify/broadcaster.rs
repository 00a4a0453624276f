//! Per-project fan-out of serialized events.
//!
//! Each project gets a `tokio::sync::broadcast` channel carrying JSON
//! payloads. While no subscriber is attached, payloads go to a bounded
//! backlog (oldest dropped first) that is handed in full to the next
//! subscriber.

use crate::errors::PublishError;
use crate::notify::throttler::Publisher;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Logical channel name for a project.
pub fn channel_name(project_id: &str) -> String {
    format!("project:{project_id}:events")
}

/// What happened to a published payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to this many live subscribers
    Broadcast(usize),
    /// Held in the backlog until someone subscribes
    Queued,
}

/// A new subscriber's view of a project channel.
#[derive(Debug)]
pub struct Subscription {
    pub channel: String,
    /// Payloads published while nobody was listening, oldest first
    pub backlog: Vec<String>,
    pub receiver: broadcast::Receiver<String>,
}

#[derive(Debug)]
struct ProjectChannel {
    sender: broadcast::Sender<String>,
    backlog: VecDeque<String>,
    dropped: u64,
}

/// Topic-per-project broadcaster with subscriber-side queueing.
#[derive(Debug)]
pub struct Broadcaster {
    channels: Mutex<HashMap<String, ProjectChannel>>,
    channel_capacity: usize,
    backlog_capacity: usize,
    available: AtomicBool,
}

impl Broadcaster {
    pub fn new(channel_capacity: usize, backlog_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
            backlog_capacity,
            available: AtomicBool::new(true),
        }
    }

    fn with_channel<R>(&self, project_id: &str, f: impl FnOnce(&mut ProjectChannel) -> R) -> R {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectChannel {
                sender: broadcast::channel(self.channel_capacity).0,
                backlog: VecDeque::new(),
                dropped: 0,
            });
        f(channel)
    }

    /// Publish a payload to a project's channel.
    ///
    /// Fails with `Saturated` when the slowest subscriber still has a full
    /// buffer unread, and with `Unavailable` after [`shutdown`](Self::shutdown).
    pub fn send(&self, project_id: &str, payload: String) -> Result<Delivery, PublishError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(PublishError::Unavailable("broadcaster is shut down".into()));
        }

        let capacity = self.channel_capacity;
        let backlog_capacity = self.backlog_capacity;
        self.with_channel(project_id, |channel| {
            if channel.sender.receiver_count() == 0 {
                if backlog_capacity == 0 {
                    channel.dropped += 1;
                    return Ok(Delivery::Queued);
                }
                while channel.backlog.len() >= backlog_capacity {
                    channel.backlog.pop_front();
                    channel.dropped += 1;
                }
                channel.backlog.push_back(payload);
                trace!(project = project_id, queued = channel.backlog.len(), "No subscribers, queued");
                return Ok(Delivery::Queued);
            }

            if channel.sender.len() >= capacity {
                return Err(PublishError::Saturated {
                    channel: channel_name(project_id),
                });
            }

            match channel.sender.send(payload) {
                Ok(receivers) => Ok(Delivery::Broadcast(receivers)),
                // The last receiver went away between the count and the send.
                Err(broadcast::error::SendError(payload)) => {
                    channel.backlog.push_back(payload);
                    Ok(Delivery::Queued)
                }
            }
        })
    }

    /// Attach to a project's channel, draining any queued backlog.
    pub fn subscribe(&self, project_id: &str) -> Subscription {
        self.with_channel(project_id, |channel| {
            let backlog: Vec<String> = channel.backlog.drain(..).collect();
            debug!(project = project_id, backlog = backlog.len(), "Subscriber attached");
            Subscription {
                channel: channel_name(project_id),
                backlog,
                receiver: channel.sender.subscribe(),
            }
        })
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(project_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn backlog_len(&self, project_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(project_id).map(|c| c.backlog.len()).unwrap_or(0)
    }

    /// Payloads discarded from a full backlog.
    pub fn dropped(&self, project_id: &str) -> u64 {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(project_id).map(|c| c.dropped).unwrap_or(0)
    }

    /// Stop accepting payloads; every later publish reports `Unavailable`.
    pub fn shutdown(&self) {
        self.available.store(false, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256, 100)
    }
}

impl Publisher for Broadcaster {
    fn publish(&self, project_id: &str, payload: &str) -> Result<(), PublishError> {
        self.send(project_id, payload.to_string()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_convention() {
        assert_eq!(channel_name("alpha"), "project:alpha:events");
    }

    #[test]
    fn test_backlog_drops_oldest_and_drains_on_subscribe() {
        let broadcaster = Broadcaster::new(8, 3);
        for i in 0..5 {
            let delivery = broadcaster.send("p", format!("e{i}")).unwrap();
            assert_eq!(delivery, Delivery::Queued);
        }
        assert_eq!(broadcaster.backlog_len("p"), 3);
        assert_eq!(broadcaster.dropped("p"), 2);

        let sub = broadcaster.subscribe("p");
        assert_eq!(sub.channel, "project:p:events");
        assert_eq!(sub.backlog, vec!["e2", "e3", "e4"]);
        assert_eq!(broadcaster.backlog_len("p"), 0);
    }

    #[tokio::test]
    async fn test_live_subscriber_receives_payloads() {
        let broadcaster = Broadcaster::new(8, 3);
        let mut sub = broadcaster.subscribe("p");

        assert_eq!(
            broadcaster.send("p", "hello".into()).unwrap(),
            Delivery::Broadcast(1)
        );
        assert_eq!(sub.receiver.recv().await.unwrap(), "hello");

        // other projects are isolated
        broadcaster.send("q", "other".into()).unwrap();
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn test_unread_buffer_reports_saturation() {
        let broadcaster = Broadcaster::new(2, 3);
        let _sub = broadcaster.subscribe("p");

        broadcaster.send("p", "a".into()).unwrap();
        broadcaster.send("p", "b".into()).unwrap();
        let err = broadcaster.send("p", "c".into()).unwrap_err();
        assert_eq!(
            err,
            PublishError::Saturated {
                channel: "project:p:events".into()
            }
        );
    }

    #[test]
    fn test_shutdown_makes_transport_unavailable() {
        let broadcaster = Broadcaster::default();
        broadcaster.shutdown();
        assert!(matches!(
            broadcaster.publish("p", "x"),
            Err(PublishError::Unavailable(_))
        ));
    }
}
