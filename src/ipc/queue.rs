//! IPC primitive based on a public/private named-queue pair, backed by
//! the [`crate::cluster::ClusterClient`] abstraction over the (external)
//! compute cluster.
//!
//! Queue handles must be opened lazily: a `Queue` may be constructed on
//! one machine (the event-loop host, when assigning a private channel to
//! a trial) and then shipped to and operated from another (the worker),
//! so eagerly opening the cluster queue at construction time would open
//! it on the wrong host. An `initialized` guard defers that until first
//! use.

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterClient, ClusterQueue, WaitPolicy};
use crate::error::{Error, Result};
use crate::ipc::Connection;
use crate::message::Message;

/// Either a fixed wait or a bounded exponential backoff; constructing a
/// [`Queue`] with both is rejected.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    Fixed(Duration),
    Backoff { max_attempts: u32 },
}

impl From<Timeout> for WaitPolicy {
    fn from(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Fixed(d) => WaitPolicy::Timeout(d),
            Timeout::Backoff { max_attempts } => WaitPolicy::Backoff { max_attempts },
        }
    }
}

pub struct Queue {
    client: Arc<dyn ClusterClient>,
    public_channel: String,
    private_channel: Option<String>,
    timeout: Timeout,
    publisher: Option<Arc<dyn ClusterQueue>>,
    subscriber: Option<Arc<dyn ClusterQueue>>,
    initialized: bool,
}

impl Queue {
    /// `private_channel = None` yields a publish-only connection — used
    /// by a worker that only ever sends requests on the public channel
    /// and receives on a different, explicitly-assigned private queue.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        public_channel: impl Into<String>,
        private_channel: Option<String>,
        timeout: Timeout,
    ) -> Self {
        Self {
            client,
            public_channel: public_channel.into(),
            private_channel,
            timeout,
            publisher: None,
            subscriber: None,
            initialized: false,
        }
    }

    fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.publisher = Some(self.client.new_queue(&self.public_channel));
        self.subscriber = self
            .private_channel
            .as_ref()
            .map(|name| self.client.new_queue(name));
        self.initialized = true;
    }
}

impl Connection for Queue {
    fn get(&mut self) -> Result<Message> {
        self.ensure_initialized();
        let subscriber = self
            .subscriber
            .as_ref()
            .ok_or_else(|| Error::Config("trying to get message on a publish-only connection".into()))?;
        let bytes = subscriber.get(self.timeout.into())?;
        Message::from_bytes(&bytes)
    }

    fn put(&mut self, message: Message) -> Result<()> {
        self.ensure_initialized();
        let bytes = message.to_bytes()?;
        self.publisher
            .as_ref()
            .expect("publisher is initialized by ensure_initialized")
            .put(bytes);
        Ok(())
    }

    fn close(&mut self) {
        // Cleanup is the cluster runtime's responsibility; dropping our
        // references to the queue handles is enough on this side.
        self.publisher = None;
        self.subscriber = None;
    }
}

/// Validates that a queue configuration does not request both a fixed
/// timeout and a retry budget — the one explicit configuration error
/// this crate rejects eagerly rather than at wait time.
pub fn validate_timeout_config(fixed: Option<Duration>, retries: Option<u32>) -> Result<Timeout> {
    match (fixed, retries) {
        (Some(_), Some(_)) => Err(Error::Config(
            "a queue cannot be configured with both a fixed timeout and a retry count".into(),
        )),
        (Some(d), None) => Ok(Timeout::Fixed(d)),
        (None, Some(n)) => Ok(Timeout::Backoff { max_attempts: n }),
        (None, None) => Ok(Timeout::Fixed(Duration::from_secs(60))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::message::TrialId;

    #[test]
    fn lazily_opens_queues_on_first_use() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
        let mut queue = Queue::new(cluster, "public", None, Timeout::Fixed(Duration::from_secs(1)));
        assert!(!queue.initialized);
        queue.put(Message::should_prune(TrialId(1))).unwrap();
        assert!(queue.initialized);
    }

    #[test]
    fn publish_only_connection_rejects_get() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
        let mut queue = Queue::new(cluster, "public", None, Timeout::Fixed(Duration::from_secs(1)));
        match queue.get() {
            Err(Error::Config(_)) => {}
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn private_channel_delivers_a_response_to_its_worker() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
        // Main writes the response directly onto the private channel's
        // underlying queue (it never reads it), the worker reads it back.
        let private = cluster.new_queue("private-1");
        let response = Message::response(TrialId(2), crate::message::ResponseData::Bool(true));
        private.put(response.to_bytes().unwrap());

        let mut worker_side = Queue::new(
            cluster,
            "public",
            Some("private-1".to_string()),
            Timeout::Fixed(Duration::from_secs(1)),
        );
        let received = worker_side.get().unwrap();
        match received {
            Message::Response { header, data } => {
                assert_eq!(header.trial_id, TrialId(2));
                assert!(matches!(data, crate::message::ResponseData::Bool(true)));
            }
            _ => panic!("unexpected message"),
        }
    }

    #[test]
    fn both_timeout_and_retry_is_a_config_error() {
        let result = validate_timeout_config(Some(Duration::from_secs(1)), Some(3));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn neither_set_falls_back_to_default_fixed_timeout() {
        let result = validate_timeout_config(None, None).unwrap();
        assert!(matches!(result, Timeout::Fixed(_)));
    }
}
