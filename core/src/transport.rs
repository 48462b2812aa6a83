use x11rb::{
    protocol::xproto::{
        Atom, ClientMessageEvent, EventMask, PropMode, SelectionNotifyEvent, Timestamp, Window,
    },
    x11_utils::X11Error,
};

use crate::Result;

/// A property value as read back from the server.
///
/// A missing property reads as `type_ == NONE` with no data. When the
/// requested type does not match, the actual type is reported with no data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyValue {
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

impl PropertyValue {
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        self.type_ == x11rb::NONE
    }

    /// Decodes a format 32 value as a list of atoms.
    #[must_use]
    pub fn atoms(&self) -> Option<Vec<Atom>> {
        if self.format != 32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| Atom::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// Encodes atoms (or any other 32 bit items) for a format 32 property.
#[must_use]
pub fn encode32(items: &[u32]) -> Vec<u8> {
    items.iter().flat_map(|i| i.to_ne_bytes()).collect()
}

/// The windowing-system requests the engine issues.
///
/// Every request is synchronous: protocol errors raised by the server come
/// back as [`Error::X11`](crate::Error::X11) from the call that caused them.
pub trait Transport {
    fn root(&self) -> Window;

    fn create_window(&mut self) -> Result<Window>;

    fn destroy_window(&mut self, window: Window) -> Result<()>;

    /// Replaces this client's event mask on `window`.
    fn select_input(&mut self, window: Window, mask: EventMask) -> Result<()>;

    /// This client's current event mask on `window`.
    fn event_mask(&mut self, window: Window) -> Result<EventMask>;

    fn change_property(
        &mut self,
        mode: PropMode,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<()>;

    fn get_property(
        &mut self,
        delete: bool,
        window: Window,
        property: Atom,
        type_: Atom,
    ) -> Result<PropertyValue>;

    fn convert_selection(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()>;

    fn set_selection_owner(
        &mut self,
        owner: Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<()>;

    fn selection_owner(&mut self, selection: Atom) -> Result<Window>;

    fn send_selection_notify(&mut self, notify: SelectionNotifyEvent) -> Result<()>;

    fn send_client_message(
        &mut self,
        destination: Window,
        mask: EventMask,
        message: ClientMessageEvent,
    ) -> Result<()>;

    /// A current server timestamp, obtained through a property change on
    /// `window` (which must select `PropertyChange`).
    fn server_time(&mut self, window: Window) -> Result<Timestamp>;
}

/// Callbacks into whoever drives the engine.
pub trait Host {
    /// Starts or stops routing events for `window` to the engine.
    fn watch(&mut self, window: Window, start: bool, mask: EventMask);

    /// The engine lost the `CLIPBOARD_MANAGER` selection for good.
    fn terminate(&mut self);

    fn error_trap_push(&mut self) {}

    /// Ends the innermost trap, reporting an error raised inside it that the
    /// requests themselves did not.
    fn error_trap_pop(&mut self) -> std::result::Result<(), X11Error> {
        Ok(())
    }
}
