use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;
use crate::channel::Channel;

/// Prefixes each payload with a one-byte checksum (the wrapping sum of all payload bytes). Data
///  with a mismatching checksum is dropped on the receiving side.
pub struct ChecksumChannel<C: Channel> {
    inner: C,
}

impl<C: Channel> ChecksumChannel<C> {
    pub fn new(inner: C) -> ChecksumChannel<C> {
        ChecksumChannel { inner }
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

impl<C: Channel> Channel for ChecksumChannel<C> {
    fn incoming_count(&self) -> usize {
        self.inner.incoming_count()
    }

    fn outgoing_count(&self) -> usize {
        self.inner.outgoing_count()
    }

    fn receive(&self, mut payload: Bytes) -> anyhow::Result<()> {
        if payload.is_empty() {
            warn!("received data without checksum - dropping");
            return Ok(());
        }

        let expected = payload[0];
        let _ = payload.split_to(1);
        let actual = checksum(&payload);
        if actual != expected {
            warn!("checksum mismatch: expected {:#04x}, was {:#04x} - dropping {} bytes", expected, actual, payload.len());
            return Ok(());
        }
        self.inner.receive(payload)
    }

    fn pop_incoming(&self) -> Option<Bytes> {
        self.inner.pop_incoming()
    }

    fn send(&self, prepared: Bytes) -> anyhow::Result<()> {
        self.inner.send(prepared)
    }

    fn pop_outgoing(&self) -> Option<Bytes> {
        self.inner.pop_outgoing()
    }

    fn prepare_to_send(&self, payload: Bytes) -> anyhow::Result<Bytes> {
        let inner_prepared = self.inner.prepare_to_send(payload)?;

        let mut buf = BytesMut::with_capacity(1 + inner_prepared.len());
        buf.put_u8(checksum(&inner_prepared));
        buf.put_slice(&inner_prepared);
        Ok(buf.freeze())
    }

    fn upkeep(&self) -> anyhow::Result<()> {
        self.inner.upkeep()
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use rstest::rstest;
    use super::*;
    use crate::channel::MockChannel;

    #[test]
    fn test_prepare_adds_checksum() {
        let mut inner = MockChannel::new();
        inner.expect_prepare_to_send()
            .returning(|p| Ok(p));

        let channel = ChecksumChannel::new(inner);
        let prepared = channel.prepare_to_send(Bytes::from_static(&[200, 100, 1])).unwrap();
        assert_eq!(prepared.as_ref(), &[45, 200, 100, 1]);
    }

    #[test]
    fn test_valid_checksum_is_passed_on() {
        let mut inner = MockChannel::new();
        inner.expect_receive()
            .with(eq(Bytes::from_static(&[200, 100, 1])))
            .times(1)
            .returning(|_| Ok(()));

        let channel = ChecksumChannel::new(inner);
        channel.receive(Bytes::from_static(&[45, 200, 100, 1])).unwrap();
    }

    #[rstest]
    #[case::wrong_checksum(vec![46, 200, 100, 1])]
    #[case::corrupt_payload(vec![45, 200, 101, 1])]
    #[case::empty(vec![])]
    fn test_mismatch_is_dropped(#[case] data: Vec<u8>) {
        let mut inner = MockChannel::new();
        inner.expect_receive()
            .never();

        let channel = ChecksumChannel::new(inner);
        channel.receive(Bytes::from(data)).unwrap();
    }
}
