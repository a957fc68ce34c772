// SPDX-License-Identifier: GPL-3.0-only

use x11rb::{protocol::xproto::Atom, NONE};

use super::conn::{XConnection, XwlError};

pub const MIME_TEXT_UTF8: &str = "text/plain;charset=utf-8";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_URI_LIST: &str = "text/uri-list";
pub const MIME_X_URI: &str = "text/x-uri";

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        CLIPBOARD,
        PRIMARY,
        XdndSelection,
        TARGETS,
        MULTIPLE,
        TIMESTAMP,
        SAVE_TARGETS,
        DELETE,
        INCR,
        UTF8_STRING,
        TEXT,
        URI_LIST: b"text/uri-list",
        NETSCAPE_URL: b"_NETSCAPE_URL",
        MOZ_URL: b"text/x-moz-url",
        WL_SELECTION,
        XdndAware,
        XdndTypeList,
        XdndEnter,
        XdndPosition,
        XdndStatus,
        XdndDrop,
        XdndLeave,
        XdndFinished,
        XdndActionCopy,
        XdndActionMove,
        XdndActionAsk,
    }
}

impl Atoms {
    /// Targets describing the selection itself rather than its content.
    pub fn is_meta_target(&self, atom: Atom) -> bool {
        atom == self.TARGETS
            || atom == self.MULTIPLE
            || atom == self.TIMESTAMP
            || atom == self.SAVE_TARGETS
    }

    fn is_uri_target(&self, atom: Atom) -> bool {
        atom == self.URI_LIST || atom == self.NETSCAPE_URL || atom == self.MOZ_URL
    }
}

/// Mime types a selection target stands for. The first entry is the canonical one.
pub fn mime_types_for_atom(
    conn: &dyn XConnection,
    atoms: &Atoms,
    atom: Atom,
) -> Result<Vec<String>, XwlError> {
    if atom == NONE {
        return Ok(Vec::new());
    }
    let mimes = if atom == atoms.UTF8_STRING {
        vec![MIME_TEXT_UTF8.to_string()]
    } else if atom == atoms.TEXT {
        vec![MIME_TEXT.to_string()]
    } else if atoms.is_uri_target(atom) {
        // Wayland clients use either name for uri lists
        vec![MIME_URI_LIST.to_string(), MIME_X_URI.to_string()]
    } else {
        vec![conn.atom_name(atom)?]
    };
    Ok(mimes)
}

pub fn atom_for_mime(
    conn: &dyn XConnection,
    atoms: &Atoms,
    mime_type: &str,
) -> Result<Atom, XwlError> {
    match mime_type {
        MIME_TEXT_UTF8 => Ok(atoms.UTF8_STRING),
        MIME_TEXT => Ok(atoms.TEXT),
        MIME_URI_LIST | MIME_X_URI => Ok(atoms.URI_LIST),
        mime_type => conn.intern_atom(mime_type),
    }
}

/// Starts interning the targets of `mime_types`, so serving TARGETS later
/// does not wait on the server.
pub fn prefetch_mime_atoms(conn: &dyn XConnection, mime_types: &[String]) -> Result<(), XwlError> {
    let names = mime_types
        .iter()
        .filter(|mime_type| {
            !matches!(
                mime_type.as_str(),
                MIME_TEXT_UTF8 | MIME_TEXT | MIME_URI_LIST | MIME_X_URI
            )
        })
        .cloned()
        .collect::<Vec<_>>();
    if names.is_empty() {
        return Ok(());
    }
    conn.prefetch_atoms(&names)
}
