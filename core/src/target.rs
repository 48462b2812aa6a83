use std::{fmt, rc::Rc};

use x11rb::protocol::xproto::Atom;

/// One target's complete data, shared between the saved contents and any
/// outgoing transfers still draining it.
pub struct TargetBuffer {
    pub target: Atom,
    pub type_: Atom,
    pub format: u8,
    data: Box<[u8]>,
}

impl TargetBuffer {
    #[must_use]
    pub fn new(target: Atom, type_: Atom, format: u8, data: impl Into<Box<[u8]>>) -> Rc<Self> {
        Rc::new(Self {
            target,
            type_,
            format,
            data: data.into(),
        })
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub const fn bytes_per_item(&self) -> usize {
        bytes_per_item(self.format)
    }

    #[must_use]
    pub fn items(&self) -> usize {
        self.data.len() / self.bytes_per_item()
    }
}

impl fmt::Debug for TargetBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetBuffer")
            .field("target", &self.target)
            .field("type_", &self.type_)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

pub(crate) const fn bytes_per_item(format: u8) -> usize {
    match format {
        16 => 2,
        32 => 4,
        _ => 1,
    }
}

/// A saved target, as tracked in the manager's contents.
#[derive(Debug)]
pub(crate) enum TargetState {
    /// The owner is still delivering this target through `INCR`.
    Incoming { data: Vec<u8> },
    Ready(Rc<TargetBuffer>),
}

#[derive(Debug)]
pub(crate) struct SavedTarget {
    pub target: Atom,
    pub state: TargetState,
}

impl SavedTarget {
    pub const fn is_incoming(&self) -> bool {
        matches!(self.state, TargetState::Incoming { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn items_follow_format() {
        let bytes = TargetBuffer::new(1, 2, 8, *b"hello");
        assert_eq!(bytes.items(), 5);

        let words = TargetBuffer::new(1, 2, 32, vec![0; 12]);
        assert_eq!(words.bytes_per_item(), 4);
        assert_eq!(words.items(), 3);
    }

    #[test]
    fn shared_until_last_release() {
        let buffer = TargetBuffer::new(1, 2, 8, *b"data");
        let transfer_ref = Rc::clone(&buffer);
        assert_eq!(Rc::strong_count(&buffer), 2);

        drop(buffer);
        assert_eq!(Rc::strong_count(&transfer_ref), 1);
        assert_eq!(transfer_ref.data(), b"data");
    }
}
