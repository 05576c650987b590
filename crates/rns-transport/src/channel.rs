//! Thin message framing over an active link.
//!
//! Deliberately not a request/response RPC layer: just a length-prefixed
//! framer/decoder pair so an embedder can carry multiple logical messages
//! over one link's DATA stream without inventing its own delimiter.

const LEN_PREFIX: usize = 4;

/// Prefixes `message` with its big-endian u32 length.
pub fn encode(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + message.len());
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    out
}

/// Accumulates inbound link DATA frames and yields complete length-prefixed
/// messages as they become available. Link DATA frames already arrive whole
/// and in order, but a logical message may itself be split across more than
/// one DATA frame by the sender, hence the buffer.
#[derive(Default)]
pub struct Decoder {
    buffer: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pops every complete message currently buffered, in arrival order.
    pub fn drain_messages(&mut self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        loop {
            if self.buffer.len() < LEN_PREFIX {
                break;
            }
            let len = u32::from_be_bytes(self.buffer[..LEN_PREFIX].try_into().unwrap()) as usize;
            if self.buffer.len() < LEN_PREFIX + len {
                break;
            }
            let message = self.buffer[LEN_PREFIX..LEN_PREFIX + len].to_vec();
            self.buffer.drain(..LEN_PREFIX + len);
            messages.push(message);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_message_round_trips() {
        let mut decoder = Decoder::new();
        decoder.feed(&encode(b"hello"));
        assert_eq!(decoder.drain_messages(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn split_across_chunks_is_reassembled() {
        let mut decoder = Decoder::new();
        let framed = encode(b"split message");
        let (first, second) = framed.split_at(3);
        decoder.feed(first);
        assert!(decoder.drain_messages().is_empty());
        decoder.feed(second);
        assert_eq!(decoder.drain_messages(), vec![b"split message".to_vec()]);
    }

    #[test]
    fn two_messages_in_one_chunk_both_drain() {
        let mut decoder = Decoder::new();
        let mut chunk = encode(b"one");
        chunk.extend_from_slice(&encode(b"two"));
        decoder.feed(&chunk);
        assert_eq!(decoder.drain_messages(), vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
