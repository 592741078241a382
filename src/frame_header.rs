use anyhow::bail;
use bytes::Buf;
use std::mem::size_of;

use crate::buffers::byte_stream::ByteStream;
use crate::buffers::BufferError;
use crate::channel::{Channel, MessageType, Target};

/// The framing that precedes every message on the wire: a bitmask byte with the channel in
///  bits 0-1 and the target in bits 2-3, followed by a sequence number for reliable channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub channel: Channel,
    pub target: Target,
    /// present iff the channel is reliable
    pub sequence: Option<u32>,
}

impl FrameHeader {
    pub const UNSEQUENCED_LEN: usize = size_of::<u8>();
    pub const SEQUENCED_LEN: usize = size_of::<u8>() + size_of::<u32>();

    const RESERVED_BITS: u8 = 0xf0;

    pub fn unsequenced(target: Target) -> FrameHeader {
        FrameHeader {
            channel: Channel::Unreliable,
            target,
            sequence: None,
        }
    }

    pub fn sequenced(channel: Channel, target: Target, sequence: u32) -> FrameHeader {
        FrameHeader {
            channel,
            target,
            sequence: Some(sequence),
        }
    }

    pub fn serialized_len_for(channel: Channel) -> usize {
        if channel.is_reliable() {
            Self::SEQUENCED_LEN
        }
        else {
            Self::UNSEQUENCED_LEN
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::serialized_len_for(self.channel)
    }

    pub fn bitmask(&self) -> u8 {
        u8::from(self.channel) | (u8::from(self.target) << 2)
    }

    pub fn ser(&self, buf: &mut ByteStream) -> Result<(), BufferError> {
        buf.write_u8(self.bitmask())?;
        if let Some(sequence) = self.sequence {
            buf.write_u32(sequence)?;
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let bitmask = buf.try_get_u8()?;

        if bitmask & Self::RESERVED_BITS != 0 {
            bail!("reserved bits are set in frame bitmask {:#04x}", bitmask);
        }
        let channel = match Channel::try_from(bitmask & 0x03) {
            Ok(channel) => channel,
            Err(_) => bail!("invalid channel {} in frame bitmask", bitmask & 0x03),
        };
        let target = match Target::try_from((bitmask >> 2) & 0x03) {
            Ok(target) => target,
            Err(_) => bail!("invalid target in frame bitmask {:#04x}", bitmask),
        };

        let sequence = if channel.is_reliable() {
            Some(buf.try_get_u32_le()?)
        }
        else {
            None
        };

        Ok(FrameHeader {
            channel,
            target,
            sequence,
        })
    }
}

/// Acknowledges receipt of a frame on a reliable channel. It is sent as a regular message on
///  the unreliable channel; lost acks are compensated for by retransmits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AckMessage {
    pub channel: Channel,
    pub sequence: u32,
}

impl AckMessage {
    /// tag + channel + sequence
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + size_of::<u8>() + size_of::<u32>();

    /// writes the complete message including the message type tag
    pub fn ser(&self, buf: &mut ByteStream) -> Result<(), BufferError> {
        buf.write_message_type(MessageType::ACKNOWLEDGEMENT)?;
        buf.write_u8(self.channel.into())?;
        buf.write_u32(self.sequence)
    }

    /// reads the message's payload, i.e. starting after the message type tag
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckMessage> {
        let raw_channel = buf.try_get_u8()?;
        let channel = match Channel::try_from(raw_channel) {
            Ok(channel) if channel.is_reliable() => channel,
            _ => bail!("ack for invalid channel {}", raw_channel),
        };
        let sequence = buf.try_get_u32_le()?;

        Ok(AckMessage {
            channel,
            sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unreliable_server(FrameHeader::unsequenced(Target::Server), vec![0x00])]
    #[case::unreliable_me(FrameHeader::unsequenced(Target::Me), vec![0x0c])]
    #[case::reliable_all(FrameHeader::sequenced(Channel::Reliable, Target::All, 1), vec![0x05, 1, 0, 0, 0])]
    #[case::ordered_others(FrameHeader::sequenced(Channel::ReliableOrdered, Target::Others, 0x01020304), vec![0x0a, 4, 3, 2, 1])]
    #[case::ordered_me_max(FrameHeader::sequenced(Channel::ReliableOrdered, Target::Me, u32::MAX), vec![0x0e, 0xff, 0xff, 0xff, 0xff])]
    fn test_ser_deser(#[case] header: FrameHeader, #[case] expected: Vec<u8>) {
        let mut buf = ByteStream::new(16);
        header.ser(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), expected.as_slice());
        assert_eq!(header.serialized_len(), expected.len());

        buf.write_u8(99).unwrap();
        assert_eq!(FrameHeader::deser(&mut buf).unwrap(), header);
        assert_eq!(buf.remaining_slice(), &[99]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::invalid_channel(vec![0x03])]
    #[case::invalid_channel_with_target(vec![0x0f, 1, 0, 0, 0])]
    #[case::reserved_bits(vec![0x10])]
    #[case::reserved_bits_high(vec![0x81, 1, 0, 0, 0])]
    #[case::reliable_without_sequence(vec![0x01])]
    #[case::ordered_truncated_sequence(vec![0x02, 1, 0, 0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut buf = ByteStream::from_slice(16, &raw);
        assert!(FrameHeader::deser(&mut buf).is_err());
    }

    #[test]
    fn test_deser_from_slice() {
        let raw = [0x09u8, 7, 0, 0, 0, 10];
        let mut b: &[u8] = &raw;
        assert_eq!(FrameHeader::deser(&mut b).unwrap(), FrameHeader::sequenced(Channel::Reliable, Target::Others, 7));
        assert_eq!(b, &[10]);
    }

    #[test]
    fn test_ack_ser() {
        let mut buf = ByteStream::new(16);
        AckMessage { channel: Channel::ReliableOrdered, sequence: 258 }.ser(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), &[2, 2, 2, 1, 0, 0]);
        assert_eq!(buf.bytes_written(), AckMessage::SERIALIZED_LEN);

        assert_eq!(buf.read_message_type(), MessageType::ACKNOWLEDGEMENT);
        assert_eq!(AckMessage::deser(&mut buf).unwrap(), AckMessage { channel: Channel::ReliableOrdered, sequence: 258 });
    }

    #[test]
    fn test_ack_ser_requires_empty_buffer() {
        let mut buf = ByteStream::from_slice(16, &[0x0c]);
        assert!(AckMessage { channel: Channel::Reliable, sequence: 1 }.ser(&mut buf).is_err());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![1, 5, 0, 0])]
    #[case::unreliable(vec![0, 5, 0, 0, 0])]
    #[case::invalid_channel(vec![3, 5, 0, 0, 0])]
    fn test_ack_deser_invalid(#[case] raw: Vec<u8>) {
        let mut buf = ByteStream::from_slice(16, &raw);
        assert!(AckMessage::deser(&mut buf).is_err());
    }
}
