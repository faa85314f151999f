//! The server-side receiver code and its marshalling.
//!
//! Which receiver gets installed depends only on `allow_overwrite`: isolated
//! (reject conflicting concurrent writers) or individual (last write wins).
//! The actual bytes shipped to the server are produced by an injected
//! `Receiver` — this crate fixes the two modes, not their wire encoding.

/// Which conflict-resolution receiver a batch should be applied through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiverMode {
    /// `allow_overwrite = false`: the default, reject-on-conflict receiver.
    Isolated,
    /// `allow_overwrite = true`: last-write-wins receiver.
    Individual,
}

/// Produces the marshalled receiver bytes for a given mode. External to this
/// crate so that the wire encoding can evolve independently of the
/// buffering and routing logic here.
pub trait Receiver: Send + Sync + 'static {
    fn marshal(&self, mode: ReceiverMode) -> Result<bytes::Bytes, String>;
}

/// Test-only receiver returning fixed bytes per mode, a trivial stub
/// collaborator for unit tests.
#[cfg(test)]
pub struct StaticReceiver;

#[cfg(test)]
impl Receiver for StaticReceiver {
    fn marshal(&self, mode: ReceiverMode) -> Result<bytes::Bytes, String> {
        match mode {
            ReceiverMode::Isolated => Ok(bytes::Bytes::from_static(b"isolated-receiver")),
            ReceiverMode::Individual => Ok(bytes::Bytes::from_static(b"individual-receiver")),
        }
    }
}
