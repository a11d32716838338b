//! Primitive code table.
//!
//! The table is closed and fixed; the wire format carries no version.

use bytes::Bytes;

/// Typed primitive codes, numbered as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PrimitiveCode {
    Undefined = 0,
    Init = 1,
    Deinit = 2,
    Regs = 3,
    Start = 4,
    Wait = 5,
    ControlPrep = 6,
    ControlRc = 7,
    ControlCodec = 8,
    ControlSei = 9,
    Control = 10,
    Reset = 11,
    Flush = 12,
}

impl PrimitiveCode {
    /// All codes in wire order.
    pub const ALL: [PrimitiveCode; 13] = [
        PrimitiveCode::Undefined,
        PrimitiveCode::Init,
        PrimitiveCode::Deinit,
        PrimitiveCode::Regs,
        PrimitiveCode::Start,
        PrimitiveCode::Wait,
        PrimitiveCode::ControlPrep,
        PrimitiveCode::ControlRc,
        PrimitiveCode::ControlCodec,
        PrimitiveCode::ControlSei,
        PrimitiveCode::Control,
        PrimitiveCode::Reset,
        PrimitiveCode::Flush,
    ];

    /// Map a raw wire code back to the table, `None` when out of range.
    pub fn from_wire(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// The decimal value written on the wire.
    pub fn wire(self) -> u32 {
        self as u32
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveCode::Undefined => "UNDEFINED",
            PrimitiveCode::Init => "INIT",
            PrimitiveCode::Deinit => "DEINIT",
            PrimitiveCode::Regs => "REGS",
            PrimitiveCode::Start => "START",
            PrimitiveCode::Wait => "WAIT",
            PrimitiveCode::ControlPrep => "CONTROL_PREP",
            PrimitiveCode::ControlRc => "CONTROL_RC",
            PrimitiveCode::ControlCodec => "CONTROL_CODEC",
            PrimitiveCode::ControlSei => "CONTROL_SEI",
            PrimitiveCode::Control => "CONTROL",
            PrimitiveCode::Reset => "RESET",
            PrimitiveCode::Flush => "FLUSH",
        }
    }

    /// True for the four typed configuration primitives.
    pub fn is_config(self) -> bool {
        matches!(
            self,
            PrimitiveCode::ControlPrep
                | PrimitiveCode::ControlRc
                | PrimitiveCode::ControlCodec
                | PrimitiveCode::ControlSei
        )
    }
}

impl std::fmt::Display for PrimitiveCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded (or to-be-encoded) protocol message.
///
/// The raw code is kept so that codes outside the table survive decoding and
/// can be reported by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Primitive {
    /// Wire code.
    pub code: u32,
    /// Raw payload; its length is the frame's `length` field.
    pub payload: Bytes,
}

impl Primitive {
    /// Build a primitive from a typed code.
    pub fn new(code: PrimitiveCode, payload: impl Into<Bytes>) -> Self {
        Self {
            code: code.wire(),
            payload: payload.into(),
        }
    }

    /// A primitive with an empty payload.
    pub fn empty(code: PrimitiveCode) -> Self {
        Self::new(code, Bytes::new())
    }

    /// Typed code, `None` for codes outside the table.
    pub fn kind(&self) -> Option<PrimitiveCode> {
        PrimitiveCode::from_wire(self.code)
    }

    /// Display name, `"UNKNOWN"` for codes outside the table.
    pub fn name(&self) -> &'static str {
        self.kind().map(PrimitiveCode::name).unwrap_or("UNKNOWN")
    }

    /// Payload byte count.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_table() {
        for (index, code) in PrimitiveCode::ALL.iter().enumerate() {
            assert_eq!(code.wire() as usize, index);
            assert_eq!(PrimitiveCode::from_wire(index as u32), Some(*code));
        }
        assert_eq!(PrimitiveCode::Flush.wire(), 12);
        assert_eq!(PrimitiveCode::from_wire(13), None);
    }

    #[test]
    fn unknown_code_keeps_raw_value() {
        let prim = Primitive {
            code: 42,
            payload: Bytes::from_static(b"x"),
        };
        assert_eq!(prim.kind(), None);
        assert_eq!(prim.name(), "UNKNOWN");
        assert_eq!(prim.code, 42);
    }

    #[test]
    fn only_typed_controls_are_config() {
        let config: Vec<_> = PrimitiveCode::ALL
            .iter()
            .filter(|code| code.is_config())
            .map(|code| code.wire())
            .collect();
        assert_eq!(config, vec![6, 7, 8, 9]);
        assert!(!PrimitiveCode::Control.is_config());
    }
}
