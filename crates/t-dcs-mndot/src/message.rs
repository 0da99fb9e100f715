//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "170 transport adapter over a link channel."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use t_dcs_core::channel::Channel;
use t_dcs_core::Result;
use tracing::trace;

use crate::bcd;
use crate::frame::FrameFormat;
use crate::property::{Framer, MndotProperty, FRAME_OVERHEAD};

/// Transport adapter binding one controller's framing context to the link
/// channel. Holds at most one property per exchange; the property is handed
/// in, exchanged, and handed back decoded.
pub struct Message<'a> {
    channel: &'a mut dyn Channel,
    framer: Framer,
}

impl<'a> Message<'a> {
    pub fn new(channel: &'a mut dyn Channel, drop: u8, format: FrameFormat) -> Self {
        Self {
            channel,
            framer: Framer::new(drop, format),
        }
    }

    /// Execute a read exchange: write the query, read the framed response,
    /// decode into the property.
    pub async fn query_prop(&mut self, prop: &mut dyn MndotProperty) -> Result<()> {
        let request = prop.encode_query(&self.framer)?;
        trace!(drop = self.framer.drop, frame = %bcd::render(&request), "query");
        self.channel.write_all(&request).await?;
        let response = self.read_frame().await?;
        trace!(drop = self.framer.drop, frame = %bcd::render(&response), "response");
        prop.decode_query(&self.framer, &response)
    }

    /// Execute a write exchange; most stores expect a 3-byte acknowledgement.
    pub async fn store_prop(&mut self, prop: &mut dyn MndotProperty) -> Result<()> {
        let request = prop.encode_store(&self.framer)?;
        trace!(drop = self.framer.drop, frame = %bcd::render(&request), "store");
        self.channel.write_all(&request).await?;
        if prop.expects_store_response() {
            let response = self.read_frame().await?;
            trace!(drop = self.framer.drop, frame = %bcd::render(&response), "ack");
            prop.decode_store(&self.framer, &response)?;
        }
        Ok(())
    }

    /// The protocol is length-prefixed, not delimited: read the 2-byte
    /// header first to learn the payload length, then the remainder.
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.channel.read_exact(&mut header).await?;
        let total = header[1] as usize + FRAME_OVERHEAD;
        let mut frame = vec![0u8; total];
        frame[..2].copy_from_slice(&header);
        self.channel.read_exact(&mut frame[2..]).await?;
        Ok(frame)
    }
}
