use bytes::{Buf, BytesMut};

use crate::{AppError, AppResult};

/// Accumulates the bytes of one connection until the codec can cut frames out of them.
///
/// Bytes are only ever appended at the tail and discarded from the head, once a
/// frame has been decoded past them.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: BytesMut,
}

impl ByteBuffer {
    pub fn with_capacity(capacity: usize) -> ByteBuffer {
        ByteBuffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// A read cursor over the accumulated bytes, positioned at the head.
    pub fn view(&self) -> BufferView<'_> {
        BufferView::new(&self.data)
    }

    /// Drops `consumed` bytes from the head.
    pub fn discard(&mut self, consumed: usize) {
        let consumed = consumed.min(self.data.len());
        self.data.advance(consumed);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Cuts as many complete frames as possible out of the buffer.
    ///
    /// `decode` is handed a cursor marked at the start of each frame; returning
    /// `Ok(None)` rewinds the cursor to that mark and stops. Every frame is passed to
    /// `deliver` in order as soon as it is decoded. The bytes of delivered frames are
    /// dropped and the unconsumed remainder stays for the next read, also when
    /// `decode` fails.
    pub fn drain_frames<M, D, F>(&mut self, mut decode: D, mut deliver: F) -> AppResult<usize>
    where
        D: FnMut(&mut BufferView<'_>) -> AppResult<Option<M>>,
        F: FnMut(M),
    {
        let mut frames = 0;
        let mut view = self.view();
        let outcome = loop {
            view.mark();
            if !view.has_remaining() {
                break Ok(());
            }
            let before = view.position();
            match decode(&mut view) {
                Ok(Some(message)) => {
                    if view.position() == before {
                        break Err(AppError::MalformedProtocol(
                            "codec produced a message without consuming input".to_string(),
                        ));
                    }
                    frames += 1;
                    deliver(message);
                }
                Ok(None) => {
                    view.reset();
                    break Ok(());
                }
                Err(e) => {
                    view.reset();
                    break Err(e);
                }
            }
        };
        let consumed = view.position();
        self.discard(consumed);
        outcome.map(|_| frames)
    }
}

/// Cursor over a borrowed byte slice with a single mark, read through [`Buf`].
#[derive(Debug, Clone)]
pub struct BufferView<'a> {
    data: &'a [u8],
    position: usize,
    mark: usize,
}

impl<'a> BufferView<'a> {
    pub fn new(data: &'a [u8]) -> BufferView<'a> {
        BufferView {
            data,
            position: 0,
            mark: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn mark(&mut self) {
        self.mark = self.position;
    }

    pub fn reset(&mut self) {
        self.position = self.mark;
    }

    /// Unread bytes without moving the cursor.
    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        self.data.get(self.position..self.position.checked_add(len)?)
    }

    /// Offset from the cursor of the first `byte`, if it has arrived yet.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.data[self.position..].iter().position(|b| *b == byte)
    }
}

impl Buf for BufferView<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn chunk(&self) -> &[u8] {
        &self.data[self.position..]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "cannot advance past the end of the buffer: {} > {}",
            cnt,
            self.remaining()
        );
        self.position += cnt;
    }
}
