use bytes::BytesMut;

/// The broker's wire-format codec, injected into the transport. The transport treats commands
///  as opaque payloads: it never inspects the encoded bytes beyond its own datagram framing.
pub trait WireFormat: Send + Sync + 'static {
    type Command: Send + Sync + 'static;

    fn encode(&self, command: &Self::Command, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Decode a complete (reassembled) payload. An `Err` means the datagram is dropped.
    fn decode(&self, raw: &[u8]) -> anyhow::Result<Self::Command>;
}
