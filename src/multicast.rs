//! The multicast flavor of the transport. There is no separate transport type: a
//!  [crate::transport::UdpTransport] created from a `multicast://` URI gets a
//!  [MulticastChannelFactory], and everything multicast-specific lives in the channel it
//!  creates - group membership, reply-to addressing, and dropping looped-back own traffic by
//!  source id.

use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use crate::buffers::buffer_pool::BufferPool;
use crate::command_channel::CommandChannel;
use crate::config::TransportConfig;
use crate::datagram_header::SourceId;
use crate::datagram_socket::CommandDatagramSocket;
use crate::transport::CommandChannelFactory;
use crate::uri::TransportUri;
use crate::wire_format::WireFormat;

/// Joins a [CommandDatagramSocket] to the group named by a `multicast://` URI.
pub struct MulticastChannelFactory {
    uri: TransportUri,
}

impl MulticastChannelFactory {
    pub fn new(uri: TransportUri) -> MulticastChannelFactory {
        MulticastChannelFactory { uri }
    }
}

#[async_trait]
impl<W: WireFormat> CommandChannelFactory<W> for MulticastChannelFactory {
    async fn create_command_channel(
        &self,
        config: &TransportConfig,
        wire_format: Arc<W>,
        buffer_pool: Arc<BufferPool>,
        source_id: SourceId,
    ) -> anyhow::Result<Arc<dyn CommandChannel<W>>> {
        let group = self.uri.resolve().await?;
        if !group.ip().is_multicast() {
            bail!("{} does not name a multicast group", self.uri);
        }

        let channel = CommandDatagramSocket::join_group(group, config, wire_format, buffer_pool, source_id).await?;
        Ok(Arc::new(channel))
    }
}
