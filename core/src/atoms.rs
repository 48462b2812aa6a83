use x11rb::{atom_manager, protocol::xproto::Atom};

atom_manager! {
    pub ProtocolAtoms:
    ProtocolAtomsCookie {
        CLIPBOARD,
        CLIPBOARD_MANAGER,
        TARGETS,
        MULTIPLE,
        TIMESTAMP,
        SAVE_TARGETS,
        ATOM_PAIR,
        INCR,
        DELETE,
        INSERT_PROPERTY,
        INSERT_SELECTION,
        PIXMAP,
        MANAGER,
        NULL,
        ATOM,
        INTEGER,
    }
}

impl ProtocolAtoms {
    /// Targets that describe the selection protocol itself rather than data
    /// and so must never be saved.
    #[must_use]
    pub fn is_meta_target(&self, target: Atom) -> bool {
        [
            self.TARGETS,
            self.MULTIPLE,
            self.DELETE,
            self.INSERT_PROPERTY,
            self.INSERT_SELECTION,
            self.PIXMAP,
        ]
        .contains(&target)
    }
}
