//! A thin wrapper around [prost](https://docs.rs/prost) used for every byte
//! blob in this workspace: RPC payloads, replicated commands, and persisted
//! raft state.

/// A message that can cross the wire or the persister.
pub trait Message: prost::Message + Default {}
impl<T: prost::Message + Default> Message for T {}

/// A message encoding error.
pub type EncodeError = prost::EncodeError;
/// A message decoding error.
pub type DecodeError = prost::DecodeError;

/// Encodes the message into `buf`.
pub fn encode<M: Message>(message: &M, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    buf.reserve(message.encoded_len());
    message.encode(buf)?;
    Ok(())
}

/// Decodes a message from the buffer.
pub fn decode<M: Message>(buf: &[u8]) -> Result<M, DecodeError> {
    M::decode(buf)
}
