use serde::{Deserialize, Serialize};
use crate::error::Error;
use crate::mailbox::Envelope;

/// The unit of data sent between ranks. Guard-zone data and the messages of
/// the completion collective share one transport, so every payload is
/// wrapped in a frame that says which of the two it is.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Halo(Envelope),
    Collective(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        rmp_serde::encode::to_vec(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        rmp_serde::decode::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Frame;
    use crate::connection::SequenceTag;
    use crate::mailbox::{Envelope, Tag};

    #[test]
    fn halo_frame_survives_encoding() {
        let frame = Frame::Halo(Envelope {
            source: 3,
            dest: 12,
            dest_rank: 1,
            tag: Tag::Remote(SequenceTag::new(3, 12, 1)),
            epoch: 4,
            data: vec![0, 1, 255],
        });
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(Frame::decode(&[0xc1, 0x00]).is_err());
    }
}
