//! UDP socket layer managing incoming/outgoing requests and responses.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{
    reject_malformed, ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific,
};
use crate::Error;

const VERSION: [u8; 4] = [75, 68, 0, 1]; // "KD" version 01
/// Largest UDP payload over IPv4, `find_node` responses grow with `k`.
const MAX_PAYLOAD: usize = 65_507;

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// How long [KrpcSocket::recv_from] blocks on an empty socket,
/// which bounds how long the listener takes to notice a shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A UdpSocket wrapper that formats and correlates DHT requests and responses.
///
/// Shared between the listener thread (calling [Self::recv_from]), the request
/// handlers (calling [Self::response] and [Self::error]) and any thread running
/// outgoing queries (calling [Self::request]).
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    next_tid: AtomicU16,
    request_timeout: Duration,
    inflight_requests: Mutex<HashMap<u16, InflightRequest>>,
    shutdown: AtomicBool,
}

#[derive(Debug)]
struct InflightRequest {
    to: SocketAddrV4,
    sender: flume::Sender<Message>,
}

impl KrpcSocket {
    pub fn new(address: SocketAddrV4, request_timeout: Duration) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(address)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(std::io::Error::new(
                    ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(Self {
            socket,
            local_addr,
            next_tid: AtomicU16::new(0),
            request_timeout,
            inflight_requests: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // === Public Methods ===

    /// Send a request to the given address and block until its response arrives,
    /// or the request times out.
    pub fn request(
        &self,
        address: SocketAddrV4,
        request: RequestSpecific,
    ) -> Result<ResponseSpecific, RequestError> {
        let message = self.request_message(request);
        let tid = message.transaction_id;

        let (sender, receiver) = flume::bounded(1);

        {
            let mut inflight_requests = self.inflight_requests.lock();

            // Under the lock, a concurrent shutdown either clears this entry or is seen here.
            if self.is_shutdown() {
                return Err(RequestError::Shutdown);
            }

            inflight_requests.insert(tid, InflightRequest { to: address, sender });
        }

        if let Err(error) = self.send(address, message) {
            self.inflight_requests.lock().remove(&tid);
            return Err(RequestError::Send(error));
        }

        match receiver.recv_timeout(self.request_timeout) {
            Ok(message) => match message.message_type {
                MessageType::Response(response) => Ok(response),
                MessageType::Error(error) => Err(RequestError::ErrorResponse(error)),
                MessageType::Request(_) => Err(RequestError::UnexpectedResponse),
            },
            Err(flume::RecvTimeoutError::Timeout) => {
                self.inflight_requests.lock().remove(&tid);
                Err(RequestError::Timeout)
            }
            Err(flume::RecvTimeoutError::Disconnected) => Err(RequestError::Shutdown),
        }
    }

    /// Send a response to the given address.
    pub fn response(&self, address: SocketAddrV4, transaction_id: u16, response: ResponseSpecific) {
        let message = self.response_message(MessageType::Response(response), transaction_id);
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&self, address: SocketAddrV4, transaction_id: u16, error: ErrorSpecific) {
        let message = self.response_message(MessageType::Error(error), transaction_id);
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Receives a single krpc message on the socket, blocking for at most [READ_TIMEOUT].
    ///
    /// Responses and errors are delivered to the matching inflight [Self::request],
    /// malformed requests are answered with a protocol error right away,
    /// and valid requests are returned with their origin for the caller to handle.
    pub fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MAX_PAYLOAD];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => match message.message_type {
                        MessageType::Request(_) => {
                            trace!(
                                context = "socket_message_receiving",
                                ?message,
                                ?from,
                                "Received request message"
                            );
                            return Some((message, from));
                        }
                        _ => {
                            trace!(
                                context = "socket_message_receiving",
                                ?message,
                                ?from,
                                "Received response message"
                            );
                            self.deliver_response(message, &from);
                        }
                    },
                    Err(error) => {
                        debug!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid message."
                        );

                        if let Some((transaction_id, rejection)) = reject_malformed(bytes, &error) {
                            self.error(from, transaction_id, rejection);
                        }
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    /// Stop accepting new requests and fail every inflight request with [RequestError::Shutdown].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.inflight_requests.lock().clear();
    }

    // === Private Methods ===

    fn deliver_response(&self, message: Message, from: &SocketAddrV4) {
        let mut inflight_requests = self.inflight_requests.lock();

        match inflight_requests.get(&message.transaction_id) {
            Some(request) if compare_socket_addr(&request.to, from) => {
                if let Some(request) = inflight_requests.remove(&message.transaction_id) {
                    let _ = request.sender.try_send(message);
                }
            }
            Some(_) => {
                trace!(
                    context = "socket_validation",
                    message = "Response from wrong address"
                );
            }
            None => {
                trace!(
                    context = "socket_validation",
                    message = "Unexpected response id"
                );
            }
        }
    }

    /// Increments next_tid and returns the previous value.
    fn tid(&self) -> u16 {
        // Ids wrap around, the timeout is short enough that
        // 65535 requests won't be inflight at the same time.
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn request_message(&self, message: RequestSpecific) -> Message {
        Message {
            transaction_id: self.tid(),
            message_type: MessageType::Request(message),
            version: Some(VERSION.to_vec()),
        }
    }

    fn response_message(&self, message: MessageType, request_tid: u16) -> Message {
        Message {
            transaction_id: request_tid,
            message_type: message,
            version: Some(VERSION.to_vec()),
        }
    }

    /// Send a raw dht message
    fn send(&self, address: SocketAddrV4, message: Message) -> Result<(), Error> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?address, message = ?message);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
/// Failure of a single outgoing request.
pub enum RequestError {
    /// No response arrived within the request timeout.
    #[error("Request timed out")]
    Timeout,

    /// The request could not be encoded or sent.
    #[error("Failed to send request: {0}")]
    Send(Error),

    /// The remote node replied with a KRPC error.
    #[error("Error response: {} {}", .0.code, .0.description)]
    ErrorResponse(ErrorSpecific),

    /// The remote node replied with a response of the wrong kind.
    #[error("Unexpected response type")]
    UnexpectedResponse,

    /// This node was shut down.
    #[error("Node was shutdown")]
    Shutdown,
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}
