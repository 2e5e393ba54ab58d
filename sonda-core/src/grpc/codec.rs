//! # JSON <-> Protobuf Codec
//!
//! A `tonic::codec::Codec` implementation that lets `tonic` transport
//! `serde_json::Value` without generated message structs. The encoder
//! validates the JSON against the request descriptor and serializes the
//! resulting `DynamicMessage`; the decoder reverses the trip for responses.
//!
//! Unknown JSON fields are tolerated on encode, so seeds written against an
//! older schema still work after the server drops a field.
use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// Transcodes between `serde_json::Value` and protobuf binary format using
/// the request and response descriptors of one method.
pub struct JsonCodec {
    req_desc: MessageDescriptor,
    res_desc: MessageDescriptor,
}

impl JsonCodec {
    pub fn new(req_desc: MessageDescriptor, res_desc: MessageDescriptor) -> Self {
        Self { req_desc, res_desc }
    }
}

impl Codec for JsonCodec {
    type Encode = serde_json::Value;
    type Decode = serde_json::Value;

    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder(self.req_desc.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder(self.res_desc.clone())
    }
}

pub struct JsonEncoder(MessageDescriptor);

impl Encoder for JsonEncoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        // serde_json::Value implements IntoDeserializer, so the value feeds
        // straight into the dynamic deserializer.
        let msg = DynamicMessage::deserialize_with_options(
            self.0.clone(),
            item,
            &DeserializeOptions::new().deny_unknown_fields(false),
        )
        .map_err(|e| {
            Status::invalid_argument(format!(
                "JSON structure does not match Protobuf schema: {}",
                e
            ))
        })?;

        msg.encode_raw(dst);
        Ok(())
    }
}

pub struct JsonDecoder(MessageDescriptor);

impl Decoder for JsonDecoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let mut msg = DynamicMessage::new(self.0.clone());
        msg.merge(src)
            .map_err(|e| Status::internal(format!("Failed to decode Protobuf bytes: {}", e)))?;

        let value = serde_json::to_value(&msg)
            .map_err(|e| Status::internal(format!("Failed to map response to JSON: {}", e)))?;

        Ok(Some(value))
    }
}
