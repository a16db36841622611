//! Transport layer abstraction for the watch stream.

use crate::error::{WatchError, WatchResult};
use docwatch_protocol::{ListenRequest, RawChange};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Client ends of one bidirectional watch stream.
#[derive(Debug)]
pub struct WatchStream {
    /// Requests to the server.
    pub outbound: mpsc::UnboundedSender<ListenRequest>,
    /// Messages from the server. An `Err` or the end of the channel closes
    /// the stream.
    pub inbound: mpsc::UnboundedReceiver<WatchResult<RawChange>>,
}

/// Opens watch streams.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (gRPC, WebSocket, mock for testing, etc.).
pub trait WatchTransport: Send + Sync {
    /// Opens a new stream.
    fn open_stream(&self) -> WatchResult<WatchStream>;
}

/// Server ends of a stream opened through [`MockTransport`].
#[derive(Debug)]
pub struct MockServerStream {
    requests: mpsc::UnboundedReceiver<ListenRequest>,
    responses: mpsc::UnboundedSender<WatchResult<RawChange>>,
}

impl MockServerStream {
    /// Waits for the next client request. `None` once the client has
    /// dropped the stream.
    pub async fn next_request(&mut self) -> Option<ListenRequest> {
        self.requests.recv().await
    }

    /// Returns a request if one is already queued.
    pub fn try_next_request(&mut self) -> Option<ListenRequest> {
        self.requests.try_recv().ok()
    }

    /// Sends a message to the client. Returns false if the client is gone.
    pub fn send(&self, change: RawChange) -> bool {
        self.responses.send(Ok(change)).is_ok()
    }

    /// Fails the stream with `error`.
    pub fn fail(&self, error: WatchError) -> bool {
        self.responses.send(Err(error)).is_ok()
    }

    /// Whether the client has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.responses.is_closed()
    }
}

/// An in-memory transport for tests.
///
/// Every successful `open_stream` hands the server ends to the
/// [`MockServer`] returned alongside the transport.
#[derive(Debug)]
pub struct MockTransport {
    accepted: mpsc::UnboundedSender<MockServerStream>,
    failures: Mutex<VecDeque<WatchError>>,
    opens: AtomicUsize,
}

/// Receives the server ends of streams opened through a [`MockTransport`].
#[derive(Debug)]
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<MockServerStream>,
}

impl MockServer {
    /// Waits for the client to open a stream.
    pub async fn next_stream(&mut self) -> Option<MockServerStream> {
        self.accepted.recv().await
    }

    /// Returns a stream if one was opened already.
    pub fn try_next_stream(&mut self) -> Option<MockServerStream> {
        self.accepted.try_recv().ok()
    }
}

impl MockTransport {
    /// Creates a mock transport and the server side that observes it.
    pub fn new() -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: accepted_tx,
                failures: Mutex::new(VecDeque::new()),
                opens: AtomicUsize::new(0),
            },
            MockServer {
                accepted: accepted_rx,
            },
        )
    }

    /// Makes the next `open_stream` call fail with `error`. Calls queue up.
    pub fn fail_next_open(&self, error: WatchError) {
        self.failures.lock().push_back(error);
    }

    /// Number of `open_stream` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl WatchTransport for MockTransport {
    fn open_stream(&self) -> WatchResult<WatchStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let server = MockServerStream {
            requests: request_rx,
            responses: response_tx,
        };
        self.accepted
            .send(server)
            .map_err(|_| WatchError::transport_fatal("mock server dropped"))?;

        Ok(WatchStream {
            outbound: request_tx,
            inbound: response_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwatch_protocol::TargetId;

    #[tokio::test]
    async fn mock_transport_pairs_streams() {
        let (transport, mut server) = MockTransport::new();
        let mut client = transport.open_stream().unwrap();
        let mut server_stream = server.next_stream().await.unwrap();

        client
            .outbound
            .send(ListenRequest::RemoveTarget {
                target_id: TargetId::new(1),
            })
            .unwrap();
        assert_eq!(
            server_stream.next_request().await,
            Some(ListenRequest::RemoveTarget {
                target_id: TargetId::new(1)
            })
        );

        assert!(server_stream.send(RawChange::TargetAdded {
            target_id: TargetId::new(1)
        }));
        assert_eq!(
            client.inbound.recv().await,
            Some(Ok(RawChange::TargetAdded {
                target_id: TargetId::new(1)
            }))
        );
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn mock_transport_fails_on_request() {
        let (transport, mut server) = MockTransport::new();
        transport.fail_next_open(WatchError::transport_retryable("offline"));

        assert!(matches!(
            transport.open_stream(),
            Err(WatchError::Transport { retryable: true, .. })
        ));
        assert!(server.try_next_stream().is_none());
        assert!(transport.open_stream().is_ok());
        assert!(server.try_next_stream().is_some());
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn dropped_client_closes_server_end() {
        let (transport, mut server) = MockTransport::new();
        let client = transport.open_stream().unwrap();
        let server_stream = server.try_next_stream().unwrap();
        assert!(!server_stream.is_closed());

        drop(client);
        assert!(server_stream.is_closed());
        assert!(!server_stream.send(RawChange::TargetReset {
            target_id: TargetId::new(1)
        }));
    }
}
