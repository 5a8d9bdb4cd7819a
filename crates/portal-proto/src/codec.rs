use bytes::{Buf, Bytes};
use prost::Message;
use thiserror::Error;

use crate::{
    CreatePortalRequest, CreatePortalResponse, Mote, OpenPortalRequest, OpenPortalResponse,
};

const PAYLOAD_TAGS: std::ops::RangeInclusive<u64> = 3..=6;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("mote has no payload")]
    MissingPayload,
    #[error("mote carries {0} payloads, expected exactly one")]
    MultiplePayloads(u32),
    #[error("malformed mote: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

/// Serialize a mote for the backplane. Motes without a payload are refused.
pub fn encode_mote(mote: &Mote) -> Result<Bytes, CodecError> {
    if mote.payload.is_none() {
        return Err(CodecError::MissingPayload);
    }
    Ok(Bytes::from(mote.encode_to_vec()))
}

/// Strict decode: the frame must set exactly one payload variant.
///
/// Plain protobuf decoding lets the last oneof field win, so the frame is
/// scanned first to count distinct payload fields.
pub fn decode_mote(frame: &[u8]) -> Result<Mote, CodecError> {
    match payload_mask(frame)?.count_ones() {
        0 => Err(CodecError::MissingPayload),
        1 => Ok(Mote::decode(frame)?),
        n => Err(CodecError::MultiplePayloads(n)),
    }
}

/// A stream frame that may embed a mote.
pub trait MoteFrame: Message + Default + Send + 'static {
    /// Field number of the embedded mote.
    const MOTE_TAG: u64;
}

impl MoteFrame for OpenPortalRequest {
    const MOTE_TAG: u64 = 2;
}

impl MoteFrame for OpenPortalResponse {
    const MOTE_TAG: u64 = 1;
}

impl MoteFrame for CreatePortalRequest {
    const MOTE_TAG: u64 = 2;
}

impl MoteFrame for CreatePortalResponse {
    const MOTE_TAG: u64 = 1;
}

/// Apply the one-payload rule to the mote embedded in an encoded stream
/// frame. A frame without a mote passes. Repeated occurrences of the mote
/// field merge on decode, so their payloads are counted together.
pub fn check_frame(frame: &[u8], mote_tag: u64) -> Result<(), CodecError> {
    let mut motes = Vec::new();
    for_each_field(frame, |tag, body| {
        if tag == mote_tag {
            motes.extend(body);
        }
    })?;
    if motes.is_empty() {
        return Ok(());
    }
    let mut seen = 0u8;
    for mote in motes {
        seen |= payload_mask(mote)?;
    }
    match seen.count_ones() {
        0 => Err(CodecError::MissingPayload),
        1 => Ok(()),
        n => Err(CodecError::MultiplePayloads(n)),
    }
}

fn payload_mask(frame: &[u8]) -> Result<u8, CodecError> {
    let mut seen: u8 = 0;
    for_each_field(frame, |tag, _| {
        if PAYLOAD_TAGS.contains(&tag) {
            seen |= 1u8 << (tag - *PAYLOAD_TAGS.start());
        }
    })?;
    Ok(seen)
}

/// Walk the top-level fields of an encoded message. Length-delimited fields
/// are handed over with their body.
fn for_each_field<'a>(
    mut buf: &'a [u8],
    mut visit: impl FnMut(u64, Option<&'a [u8]>),
) -> Result<(), CodecError> {
    while buf.has_remaining() {
        let key = prost::encoding::decode_varint(&mut buf)?;
        let tag = key >> 3;
        if tag == 0 {
            return Err(CodecError::Malformed("zero field tag"));
        }
        match key & 0x7 {
            0 => {
                prost::encoding::decode_varint(&mut buf)?;
                visit(tag, None);
            }
            1 => {
                skip(&mut buf, 8)?;
                visit(tag, None);
            }
            2 => {
                let len = prost::encoding::decode_varint(&mut buf)?;
                let len = usize::try_from(len)
                    .map_err(|_| CodecError::Malformed("length overflows usize"))?;
                if buf.len() < len {
                    return Err(CodecError::Malformed("truncated field"));
                }
                let (body, rest) = buf.split_at(len);
                visit(tag, Some(body));
                buf = rest;
            }
            5 => {
                skip(&mut buf, 4)?;
                visit(tag, None);
            }
            _ => return Err(CodecError::Malformed("unsupported wire type")),
        }
    }
    Ok(())
}

fn skip(buf: &mut &[u8], len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Malformed("truncated field"));
    }
    buf.advance(len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mote::Payload;
    use crate::{BytesPayload, BytesPayloadKind, ReplPayload, UdpPayload};

    fn udp_mote() -> Mote {
        Mote {
            stream_id: "6c1c".into(),
            seq_id: 42,
            payload: Some(Payload::Udp(UdpPayload {
                data: b"query".to_vec(),
                dst_addr: "1.2.3.4".into(),
                dst_port: 53,
            })),
        }
    }

    #[test]
    fn encodes_and_decodes_single_payload() {
        let mote = udp_mote();
        let frame = encode_mote(&mote).expect("encode");
        assert_eq!(decode_mote(&frame).expect("decode"), mote);
    }

    #[test]
    fn rejects_missing_payload() {
        let empty = Mote {
            stream_id: "s".into(),
            seq_id: 1,
            payload: None,
        };
        assert_eq!(encode_mote(&empty), Err(CodecError::MissingPayload));
        let frame = empty.encode_to_vec();
        assert_eq!(decode_mote(&frame), Err(CodecError::MissingPayload));
    }

    #[test]
    fn rejects_two_payload_variants() {
        let mut frame = udp_mote().encode_to_vec();
        let repl = Mote {
            stream_id: String::new(),
            seq_id: 0,
            payload: Some(Payload::Repl(ReplPayload {
                data: b"whoami".to_vec(),
            })),
        };
        frame.extend(repl.encode_to_vec());
        assert_eq!(decode_mote(&frame), Err(CodecError::MultiplePayloads(2)));
    }

    #[test]
    fn repeated_same_variant_is_one_payload() {
        let first = Mote {
            stream_id: "s".into(),
            seq_id: 0,
            payload: Some(Payload::Bytes(BytesPayload {
                data: b"a".to_vec(),
                kind: BytesPayloadKind::Data as i32,
            })),
        };
        let mut frame = first.encode_to_vec();
        frame.extend(first.encode_to_vec());
        assert!(decode_mote(&frame).is_ok());
    }

    fn doubled_mote() -> Vec<u8> {
        let mut mote = udp_mote().encode_to_vec();
        mote.extend(
            Mote {
                stream_id: String::new(),
                seq_id: 0,
                payload: Some(Payload::Repl(ReplPayload {
                    data: b"whoami".to_vec(),
                })),
            }
            .encode_to_vec(),
        );
        mote
    }

    /// `OpenPortalRequest { portal_id, mote }` with the mote given as raw bytes.
    fn request_frame(portal_id: i64, motes: &[&[u8]]) -> Vec<u8> {
        let mut frame = Vec::new();
        prost::encoding::int64::encode(1, &portal_id, &mut frame);
        for mote in motes {
            prost::encoding::bytes::encode(2, &mote.to_vec(), &mut frame);
        }
        frame
    }

    #[test]
    fn stream_frames_follow_the_one_payload_rule() {
        let single = udp_mote().encode_to_vec();
        let doubled = doubled_mote();

        assert_eq!(check_frame(&request_frame(7, &[]), 2), Ok(()));
        assert_eq!(check_frame(&request_frame(7, &[&single]), 2), Ok(()));
        assert_eq!(
            check_frame(&request_frame(7, &[&doubled]), 2),
            Err(CodecError::MultiplePayloads(2))
        );
        // Plain prost keeps the last variant.
        let lenient = OpenPortalRequest::decode(request_frame(7, &[&doubled]).as_slice())
            .expect("decode");
        assert!(matches!(
            lenient.mote.and_then(|m| m.payload),
            Some(Payload::Repl(_))
        ));
    }

    #[test]
    fn split_mote_fields_are_counted_together() {
        let udp = udp_mote().encode_to_vec();
        let repl = Mote {
            stream_id: String::new(),
            seq_id: 0,
            payload: Some(Payload::Repl(ReplPayload { data: b"id".to_vec() })),
        }
        .encode_to_vec();
        assert_eq!(
            check_frame(&request_frame(7, &[&udp, &repl]), 2),
            Err(CodecError::MultiplePayloads(2))
        );
        let empty = Mote {
            stream_id: "s".into(),
            seq_id: 0,
            payload: None,
        }
        .encode_to_vec();
        assert_eq!(
            check_frame(&request_frame(7, &[&empty]), 2),
            Err(CodecError::MissingPayload)
        );
    }

    #[test]
    fn rejects_truncated_frame() {
        let frame = encode_mote(&udp_mote()).expect("encode");
        let cut = &frame[..frame.len() - 2];
        assert!(matches!(
            decode_mote(cut),
            Err(CodecError::Malformed(_)) | Err(CodecError::Decode(_))
        ));
    }
}
