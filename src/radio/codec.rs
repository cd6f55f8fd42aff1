//! ToRadio / FromRadio envelopes and the nested payloads carried inside
//! mesh packets.
use bytes::{Bytes, BytesMut};
use prost::Message;
use rand::Rng;

use crate::errors::CodecError;
use crate::metrics;
use crate::protobuf::proto;
use proto::from_radio::PayloadVariant as FRPayload;
use proto::to_radio::PayloadVariant as TRPayload;

/// Largest FromRadio/ToRadio the firmware will produce or accept.
pub const MAX_FRAME_SIZE: usize = 512;

/// A decoded from-radio value; tagged by payload kind.
pub type InboundPacket = FRPayload;

/// Decode one from-radio characteristic value.
pub fn decode_from_radio(data: &[u8]) -> Result<InboundPacket, CodecError> {
    let decoded = proto::FromRadio::decode(data).map_err(|e| {
        metrics::inc_decode_failures();
        CodecError::Decode(e)
    })?;
    match decoded.payload_variant {
        Some(v) => {
            metrics::inc_frames_decoded();
            Ok(v)
        }
        None => Err(CodecError::Empty),
    }
}

pub fn encode_from_radio(variant: FRPayload) -> Bytes {
    let msg = proto::FromRadio {
        id: 0,
        payload_variant: Some(variant),
    };
    encode(&msg)
}

pub fn encode_to_radio(variant: TRPayload) -> Result<Bytes, CodecError> {
    let msg = proto::ToRadio {
        payload_variant: Some(variant),
    };
    let out = encode(&msg);
    if out.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(out.len()));
    }
    Ok(out)
}

pub fn decode_to_radio(data: &[u8]) -> Result<TRPayload, CodecError> {
    proto::ToRadio::decode(data)?
        .payload_variant
        .ok_or(CodecError::Empty)
}

pub fn want_config(nonce: u32) -> Result<Bytes, CodecError> {
    encode_to_radio(TRPayload::WantConfigId(nonce))
}

pub fn mesh_packet(packet: proto::MeshPacket) -> Result<Bytes, CodecError> {
    encode_to_radio(TRPayload::Packet(packet))
}

pub fn mqtt_proxy(message: proto::MqttClientProxyMessage) -> Result<Bytes, CodecError> {
    encode_to_radio(TRPayload::MqttClientProxyMessage(message))
}

/// Decode the payload of a mesh packet's `decoded` field.
pub fn decode_payload<M: Message + Default>(payload: &[u8]) -> Result<M, CodecError> {
    M::decode(payload).map_err(|e| {
        metrics::inc_decode_failures();
        CodecError::Decode(e)
    })
}

/// Fresh mesh packet id in `[255, u32::MAX)`; lower ids are left to the firmware.
pub fn random_packet_id() -> u32 {
    rand::thread_rng().gen_range(255..u32::MAX)
}

pub fn encode<M: Message>(msg: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(msg.encoded_len());
    // BytesMut grows on demand, so encoding cannot run out of space
    let _ = msg.encode(&mut buf);
    buf.freeze()
}

/// `"<LEVEL> | [<source>] <message>"` for a firmware log record.
pub fn format_log_record(record: &proto::LogRecord) -> String {
    let level = proto::log_record::Level::try_from(record.level)
        .map(|l| l.as_str_name())
        .unwrap_or("UNSET");
    if record.source.is_empty() {
        format!("{} | {}", level, record.message.trim_end())
    } else {
        format!("{} | [{}] {}", level, record.source, record.message.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn want_config_is_field_three() {
        let bytes = want_config(0x0102).unwrap();
        // tag (3 << 3 | varint) then varint 0x0102
        assert_eq!(&bytes[..], &[0x18, 0x82, 0x02]);
        assert_eq!(decode_to_radio(&bytes).unwrap(), TRPayload::WantConfigId(0x0102));
    }

    #[test]
    fn config_complete_decodes() {
        let frame = encode_from_radio(FRPayload::ConfigCompleteId(77));
        assert_eq!(decode_from_radio(&frame).unwrap(), FRPayload::ConfigCompleteId(77));
    }

    #[test]
    fn empty_and_garbage_frames_are_errors() {
        assert!(matches!(decode_from_radio(&[]), Err(CodecError::Empty)));
        assert!(matches!(
            decode_from_radio(&[0xff, 0xff, 0xff]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn oversized_to_radio_is_rejected() {
        let packet = proto::MeshPacket {
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::from(vec![b'x'; 600]),
                ..Default::default()
            })),
            ..Default::default()
        };
        assert!(matches!(mesh_packet(packet), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn log_record_formatting() {
        let rec = proto::LogRecord {
            message: "Booting\n".into(),
            source: "Power".into(),
            level: proto::log_record::Level::Info as i32,
            time: 0,
        };
        assert_eq!(format_log_record(&rec), "INFO | [Power] Booting");
    }
}
