use std::io::Write;

use flate2::write::ZlibDecoder;
use hagfish_types::GatewayPayload;

use crate::error::{Error, Result};

/// the gateway wire encoding for one connection
///
/// `Json` carries one payload per text frame. `JsonZlibStream` carries a
/// single zlib stream split across binary frames; a payload is complete
/// when the accumulated bytes end with the sync-flush marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Json,
    JsonZlibStream,
}

impl Transport {
    /// query string suffix for the gateway url
    pub fn url_params(self) -> &'static str {
        match self {
            Transport::Json => "v=9&encoding=json",
            Transport::JsonZlibStream => "v=9&encoding=json&compress=zlib-stream",
        }
    }
}

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// decodes inbound frames for one connection; owns the streaming inflater
pub struct FrameDecoder {
    inflater: Option<ZlibDecoder<Vec<u8>>>,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(transport: Transport) -> FrameDecoder {
        FrameDecoder {
            inflater: match transport {
                Transport::Json => None,
                Transport::JsonZlibStream => Some(ZlibDecoder::new(Vec::new())),
            },
            pending: Vec::new(),
        }
    }

    /// decode a text frame (json transport)
    pub fn decode_text(&self, text: &str) -> Result<GatewayPayload> {
        if self.inflater.is_some() {
            return Err(Error::Inflate(
                "unexpected text frame on compressed transport".to_owned(),
            ));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// feed one binary frame; returns a payload once the stream reaches a
    /// sync-flush boundary, `None` while a payload is still split across
    /// frames
    pub fn decode_binary(&mut self, bytes: &[u8]) -> Result<Option<GatewayPayload>> {
        let Some(inflater) = &mut self.inflater else {
            return Err(Error::Inflate(
                "unexpected binary frame on uncompressed transport".to_owned(),
            ));
        };

        self.pending.extend_from_slice(bytes);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        inflater
            .write_all(&self.pending)
            .and_then(|()| inflater.flush())
            .map_err(|e| Error::Inflate(e.to_string()))?;
        self.pending.clear();

        let decompressed = inflater.get_mut();
        let payload = serde_json::from_slice(decompressed)?;
        decompressed.clear();
        Ok(Some(payload))
    }
}

/// encode an outbound payload; the send side is always textual json
pub fn encode(payload: &GatewayPayload) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

#[cfg(test)]
mod tests {
    use flate2::write::ZlibEncoder;
    use flate2::{Compression, FlushCompress};
    use hagfish_types::gateway::op;

    use super::*;

    fn sync_flushed(data: &[u8]) -> Vec<u8> {
        // produce one zlib-stream chunk terminated by Z_SYNC_FLUSH
        let mut compress = flate2::Compress::new(Compression::default(), true);
        let mut out = vec![0u8; data.len() + 64];
        compress
            .compress(data, &mut out, FlushCompress::Sync)
            .unwrap();
        out.truncate(compress.total_out() as usize);
        out
    }

    #[test]
    fn json_text_frames() {
        let decoder = FrameDecoder::new(Transport::Json);
        let payload = decoder.decode_text(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(payload.op, op::HELLO);
    }

    #[test]
    fn zlib_stream_reassembles_split_frames() {
        let mut decoder = FrameDecoder::new(Transport::JsonZlibStream);
        let chunk = sync_flushed(br#"{"op":11}"#);
        assert!(chunk.ends_with(&ZLIB_SUFFIX));

        // split mid-payload: first frame is incomplete
        let (a, b) = chunk.split_at(chunk.len() / 2);
        assert!(decoder.decode_binary(a).unwrap().is_none());
        let payload = decoder.decode_binary(b).unwrap().expect("complete payload");
        assert_eq!(payload.op, op::HEARTBEAT_ACK);
    }

    #[test]
    fn zlib_stream_decodes_consecutive_payloads() {
        // one shared stream across payloads, like the real gateway
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        let mut decoder = FrameDecoder::new(Transport::JsonZlibStream);
        for raw in [br#"{"op":11}"#.as_slice(), br#"{"op":1,"d":null}"#.as_slice()] {
            encoder.write_all(raw).unwrap();
            encoder.flush().unwrap();
            let frame = encoder.get_mut().clone();
            encoder.get_mut().clear();
            let payload = decoder.decode_binary(&frame).unwrap().expect("payload");
            assert!(payload.op == op::HEARTBEAT_ACK || payload.op == op::HEARTBEAT);
        }
    }

    #[test]
    fn text_frame_on_compressed_transport_is_an_error() {
        let decoder = FrameDecoder::new(Transport::JsonZlibStream);
        assert!(decoder.decode_text("{}").is_err());
    }
}
