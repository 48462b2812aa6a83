use std::rc::Rc;

use log::trace;
use x11rb::protocol::xproto::{Atom, PropMode, Window};

use crate::{Result, TargetBuffer, Transport};

#[derive(Debug)]
enum Stage {
    /// Not yet known whether the data fits in a single property write.
    Unresolved,
    Sending {
        buffer: Rc<TargetBuffer>,
        offset: usize,
    },
}

/// One conversion of a saved target into a requestor's property, kept alive
/// across `PropertyNotify` events when the data must be sent with `INCR`.
#[derive(Debug)]
pub struct TransferState {
    pub requestor: Window,
    pub target: Atom,
    pub property: Atom,
    stage: Stage,
}

impl TransferState {
    #[must_use]
    pub const fn begin(requestor: Window, target: Atom, property: Atom) -> Self {
        Self {
            requestor,
            target,
            property,
            stage: Stage::Unresolved,
        }
    }

    pub fn start_incremental(&mut self, buffer: Rc<TargetBuffer>) {
        self.stage = Stage::Sending { buffer, offset: 0 };
    }

    #[must_use]
    pub const fn is_incremental(&self) -> bool {
        matches!(self.stage, Stage::Sending { .. })
    }

    /// Bytes delivered so far, if the transfer went incremental.
    #[must_use]
    pub const fn offset(&self) -> Option<usize> {
        match self.stage {
            Stage::Unresolved => None,
            Stage::Sending { offset, .. } => Some(offset),
        }
    }

    /// Appends the next chunk of at most `max_size` bytes to the requestor's
    /// property. Returns `true` once the terminating empty chunk was written.
    pub fn send_chunk(&mut self, transport: &mut impl Transport, max_size: usize) -> Result<bool> {
        let Stage::Sending { buffer, offset } = &mut self.stage else {
            return Ok(true);
        };

        let unit = buffer.bytes_per_item();
        let remaining = &buffer.data()[*offset..];
        let len = remaining.len().min(max_size.max(unit) / unit * unit);
        let chunk = &remaining[..len];

        trace!(
            "Appending {len} bytes at offset {offset} to property {} of {}.",
            self.property, self.requestor
        );
        transport.change_property(
            PropMode::APPEND,
            self.requestor,
            self.property,
            buffer.type_,
            buffer.format,
            chunk,
        )?;
        *offset += len;

        Ok(len == 0)
    }
}
