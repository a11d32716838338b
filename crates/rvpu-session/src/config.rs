//! Session and encoder configuration records.
//!
//! The CONTROL_* records travel as fixed-size little-endian structs; the
//! dispatcher checks their length before decoding. [`SessionConfig`] travels
//! as JSON in the INIT payload.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use rvpu_frame::PrimitiveCode;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Round-trip completion deadline used when a session does not pick one.
pub const DEFAULT_ROUND_TRIP_TIMEOUT: Duration = Duration::from_millis(50);
/// Ready-flag poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Ready-flag polls before a wait gives up.
pub const MAX_POLLS: u32 = 50;
/// Quality used when a JPEG quant is out of range.
pub const DEFAULT_JPEG_QUANT: u32 = 8;
/// Highest accepted JPEG quant.
pub const MAX_JPEG_QUANT: u32 = 10;

bitflags! {
    /// Pending configuration records not yet delivered to the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeMask: u32 {
        const PREP = 1 << 0;
        const RC = 1 << 1;
        const CODEC = 1 << 2;
        const SEI = 1 << 3;
    }
}

bitflags! {
    /// Fields a [`PrepConfig`] updates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrepChange: u16 {
        const INPUT = 1 << 0;
        const FORMAT = 1 << 2;
    }
}

bitflags! {
    /// Fields an [`H264Config`] updates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct H264Change: u32 {
        const PROFILE = 1 << 1;
        const ENTROPY = 1 << 2;
        const TRANS_8X8 = 1 << 3;
        const CONST_INTRA = 1 << 4;
        const QP_LIMIT = 1 << 8;
    }
}

bitflags! {
    /// Fields a [`JpegConfig`] updates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct JpegChange: u32 {
        const QUANT = 1 << 0;
    }
}

/// Backend engine a session runs against, chosen once at INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    H264Decoder,
    H264Encoder,
    JpegEncoder,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::H264Decoder,
        BackendKind::H264Encoder,
        BackendKind::JpegEncoder,
    ];

    pub fn codec(self) -> CodecKind {
        match self {
            BackendKind::H264Decoder | BackendKind::H264Encoder => CodecKind::H264,
            BackendKind::JpegEncoder => CodecKind::Jpeg,
        }
    }

    pub fn is_encoder(self) -> bool {
        !matches!(self, BackendKind::H264Decoder)
    }

    /// Configuration records this backend consumes; the rest are ignored.
    pub fn accepted_changes(self) -> ChangeMask {
        match self {
            BackendKind::H264Decoder => ChangeMask::empty(),
            BackendKind::H264Encoder => ChangeMask::all(),
            BackendKind::JpegEncoder => ChangeMask::PREP | ChangeMask::CODEC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::H264Decoder => "h264_decoder",
            BackendKind::H264Encoder => "h264_encoder",
            BackendKind::JpegEncoder => "jpeg_encoder",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown backend '{s}'"))
    }
}

/// Codec family of a codec record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    H264,
    Jpeg,
}

impl CodecKind {
    /// Wire size of this codec's CONTROL_CODEC record.
    pub fn record_size(self) -> usize {
        match self {
            CodecKind::H264 => H264Config::SIZE,
            CodecKind::Jpeg => JpegConfig::SIZE,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::H264 => f.write_str("h264"),
            CodecKind::Jpeg => f.write_str("jpeg"),
        }
    }
}

/// How the client learns that a task completed. Fixed per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CompletionMode {
    /// The engine host answers WAIT with a WAIT primitive.
    RoundTrip { timeout_ms: u64 },
    /// The engine host publishes the byte count into the ready flag.
    Polling { interval_ms: u64, max_polls: u32 },
}

impl CompletionMode {
    pub fn round_trip() -> Self {
        CompletionMode::RoundTrip {
            timeout_ms: DEFAULT_ROUND_TRIP_TIMEOUT.as_millis() as u64,
        }
    }

    pub fn polling() -> Self {
        CompletionMode::Polling {
            interval_ms: POLL_INTERVAL.as_millis() as u64,
            max_polls: MAX_POLLS,
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, CompletionMode::Polling { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompletionMode::RoundTrip { .. } => "round_trip",
            CompletionMode::Polling { .. } => "polling",
        }
    }
}

impl Default for CompletionMode {
    fn default() -> Self {
        Self::polling()
    }
}

/// Per-session settings carried by INIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub backend: BackendKind,
    #[serde(default)]
    pub completion: CompletionMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::H264Encoder,
            completion: CompletionMode::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(backend: BackendKind, completion: CompletionMode) -> Self {
        Self {
            backend,
            completion,
        }
    }

    /// INIT payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

fn check_size(record: &'static str, expected: usize, bytes: &[u8]) -> Result<(), ConfigError> {
    if bytes.len() != expected {
        return Err(ConfigError::SizeMismatch {
            record,
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Input frame preparation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepConfig {
    pub change: PrepChange,
    pub width: u16,
    pub height: u16,
    pub hor_stride: u16,
    pub ver_stride: u16,
    pub format: u16,
}

impl PrepConfig {
    pub const SIZE: usize = 12;

    /// Input geometry update with strides equal to the frame size.
    pub fn input(width: u16, height: u16) -> Self {
        Self {
            change: PrepChange::INPUT,
            width,
            height,
            hor_stride: width,
            ver_stride: height,
            format: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.change.bits(),
            self.width,
            self.height,
            self.hor_stride,
            self.ver_stride,
            self.format,
        ];
        for (slot, value) in out.chunks_exact_mut(2).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        check_size("prep", Self::SIZE, bytes)?;
        Ok(Self {
            change: PrepChange::from_bits_retain(u16_at(bytes, 0)),
            width: u16_at(bytes, 2),
            height: u16_at(bytes, 4),
            hor_stride: u16_at(bytes, 6),
            ver_stride: u16_at(bytes, 8),
            format: u16_at(bytes, 10),
        })
    }

    /// Range checks for an encoder backend, applied when the input geometry
    /// changes.
    pub fn validate(&self, backend: BackendKind) -> Result<(), ConfigError> {
        if !self.change.contains(PrepChange::INPUT) {
            return Ok(());
        }
        let limits: [(&'static str, u16, u32, u32); 4] = match backend.codec() {
            CodecKind::H264 => [
                ("width", self.width, 0, 1920),
                ("height", self.height, 0, 3840),
                ("hor_stride", self.hor_stride, 0, 3840),
                ("ver_stride", self.ver_stride, 0, 3840),
            ],
            CodecKind::Jpeg => [
                ("width", self.width, 16, 8192),
                ("height", self.height, 16, 8192),
                ("hor_stride", self.hor_stride.max(self.width), 16, u32::from(u16::MAX)),
                ("ver_stride", self.ver_stride.max(self.height), 16, u32::from(u16::MAX)),
            ],
        };
        for (field, value, min, max) in limits {
            let value = u32::from(value);
            if value < min || value > max {
                return Err(ConfigError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Apply the fields named by `src.change`, accumulating its change bits.
    pub fn merge_from(&mut self, src: &PrepConfig) {
        if src.change.contains(PrepChange::INPUT) {
            self.width = src.width;
            self.height = src.height;
            self.hor_stride = src.hor_stride;
            self.ver_stride = src.ver_stride;
        }
        if src.change.contains(PrepChange::FORMAT) {
            self.format = src.format;
        }
        self.change |= src.change;
    }
}

/// Rate control settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RcConfig {
    pub change: u32,
    pub rc_mode: u32,
    pub bps_target: u32,
    pub bps_max: u32,
    pub bps_min: u32,
    pub fps_in_num: u16,
    pub fps_in_denom: u16,
    pub fps_out_num: u16,
    pub fps_out_denom: u16,
    pub gop: u32,
}

impl RcConfig {
    pub const SIZE: usize = 32;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.change.to_le_bytes());
        out[4..8].copy_from_slice(&self.rc_mode.to_le_bytes());
        out[8..12].copy_from_slice(&self.bps_target.to_le_bytes());
        out[12..16].copy_from_slice(&self.bps_max.to_le_bytes());
        out[16..20].copy_from_slice(&self.bps_min.to_le_bytes());
        out[20..22].copy_from_slice(&self.fps_in_num.to_le_bytes());
        out[22..24].copy_from_slice(&self.fps_in_denom.to_le_bytes());
        out[24..26].copy_from_slice(&self.fps_out_num.to_le_bytes());
        out[26..28].copy_from_slice(&self.fps_out_denom.to_le_bytes());
        out[28..32].copy_from_slice(&self.gop.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        check_size("rc", Self::SIZE, bytes)?;
        Ok(Self {
            change: u32_at(bytes, 0),
            rc_mode: u32_at(bytes, 4),
            bps_target: u32_at(bytes, 8),
            bps_max: u32_at(bytes, 12),
            bps_min: u32_at(bytes, 16),
            fps_in_num: u16_at(bytes, 20),
            fps_in_denom: u16_at(bytes, 22),
            fps_out_num: u16_at(bytes, 24),
            fps_out_denom: u16_at(bytes, 26),
            gop: u32_at(bytes, 28),
        })
    }
}

/// H.264 encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct H264Config {
    pub change: H264Change,
    pub profile: u32,
    pub level: u32,
    pub entropy: u8,
    pub cabac_init_idc: u8,
    pub transform8x8: u8,
    pub constrained_intra: u8,
    pub qp_init: u8,
    pub qp_max: u8,
    pub qp_min: u8,
    pub qp_max_step: u8,
}

impl H264Config {
    pub const SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.change.bits().to_le_bytes());
        out[4..8].copy_from_slice(&self.profile.to_le_bytes());
        out[8..12].copy_from_slice(&self.level.to_le_bytes());
        out[12..20].copy_from_slice(&[
            self.entropy,
            self.cabac_init_idc,
            self.transform8x8,
            self.constrained_intra,
            self.qp_init,
            self.qp_max,
            self.qp_min,
            self.qp_max_step,
        ]);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        check_size("h264 codec", Self::SIZE, bytes)?;
        Ok(Self {
            change: H264Change::from_bits_retain(u32_at(bytes, 0)),
            profile: u32_at(bytes, 4),
            level: u32_at(bytes, 8),
            entropy: bytes[12],
            cabac_init_idc: bytes[13],
            transform8x8: bytes[14],
            constrained_intra: bytes[15],
            qp_init: bytes[16],
            qp_max: bytes[17],
            qp_min: bytes[18],
            qp_max_step: bytes[19],
        })
    }

    /// Apply the field groups named by `src.change`. Change bits accumulate
    /// so several records between two encodes all take effect.
    pub fn merge_from(&mut self, src: &H264Config) {
        let change = src.change;
        if change.contains(H264Change::PROFILE) {
            self.profile = src.profile;
            self.level = src.level;
        }
        if change.contains(H264Change::ENTROPY) {
            self.entropy = src.entropy;
            self.cabac_init_idc = src.cabac_init_idc;
        }
        if change.contains(H264Change::TRANS_8X8) {
            self.transform8x8 = src.transform8x8;
        }
        if change.contains(H264Change::CONST_INTRA) {
            self.constrained_intra = src.constrained_intra;
        }
        if change.contains(H264Change::QP_LIMIT) {
            self.qp_init = src.qp_init;
            self.qp_max = src.qp_max;
            self.qp_min = src.qp_min;
            self.qp_max_step = src.qp_max_step;
        }
        self.change |= change;
    }
}

/// JPEG encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JpegConfig {
    pub change: JpegChange,
    pub quant: u32,
}

impl JpegConfig {
    pub const SIZE: usize = 8;

    pub fn quant(quant: u32) -> Self {
        Self {
            change: JpegChange::QUANT,
            quant,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.change.bits().to_le_bytes());
        out[4..8].copy_from_slice(&self.quant.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        check_size("jpeg codec", Self::SIZE, bytes)?;
        Ok(Self {
            change: JpegChange::from_bits_retain(u32_at(bytes, 0)),
            quant: u32_at(bytes, 4),
        })
    }

    /// Apply a quant update, substituting the default quality when out of
    /// range. Leaves no pending change bits.
    pub fn merge_from(&mut self, src: &JpegConfig) {
        if src.change.contains(JpegChange::QUANT) {
            self.quant = if src.quant > MAX_JPEG_QUANT {
                tracing::warn!(
                    quant = src.quant,
                    fallback = DEFAULT_JPEG_QUANT,
                    "jpeg quant out of range"
                );
                DEFAULT_JPEG_QUANT
            } else {
                src.quant
            };
        }
        self.change = JpegChange::empty();
    }
}

/// Codec-specific record for CONTROL_CODEC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecConfig {
    H264(H264Config),
    Jpeg(JpegConfig),
}

impl CodecConfig {
    /// Empty record for a codec family.
    pub fn for_codec(kind: CodecKind) -> Self {
        match kind {
            CodecKind::H264 => CodecConfig::H264(H264Config::default()),
            CodecKind::Jpeg => CodecConfig::Jpeg(JpegConfig::default()),
        }
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            CodecConfig::H264(_) => CodecKind::H264,
            CodecConfig::Jpeg(_) => CodecKind::Jpeg,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            CodecConfig::H264(cfg) => cfg.encode().to_vec(),
            CodecConfig::Jpeg(cfg) => cfg.encode().to_vec(),
        }
    }

    pub fn decode(kind: CodecKind, bytes: &[u8]) -> Result<Self, ConfigError> {
        match kind {
            CodecKind::H264 => H264Config::decode(bytes).map(CodecConfig::H264),
            CodecKind::Jpeg => JpegConfig::decode(bytes).map(CodecConfig::Jpeg),
        }
    }

    pub fn merge_from(&mut self, src: &CodecConfig) -> Result<(), ConfigError> {
        match (self, src) {
            (CodecConfig::H264(dst), CodecConfig::H264(src)) => dst.merge_from(src),
            (CodecConfig::Jpeg(dst), CodecConfig::Jpeg(src)) => dst.merge_from(src),
            (dst, src) => {
                return Err(ConfigError::CodecMismatch {
                    expected: dst.kind(),
                    got: src.kind(),
                })
            }
        }
        Ok(())
    }
}

/// Supplemental enhancement information insertion mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeiMode(pub u32);

impl SeiMode {
    pub const DISABLE: SeiMode = SeiMode(0);
    pub const ONE_SEQ: SeiMode = SeiMode(1);
    pub const ONE_FRAME: SeiMode = SeiMode(2);
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        self.0.to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        check_size("sei", Self::SIZE, bytes)?;
        Ok(SeiMode(u32_at(bytes, 0)))
    }
}

/// One configuration change requested by the codec framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRequest {
    Prep(PrepConfig),
    Rc(RcConfig),
    Codec(CodecConfig),
    Sei(SeiMode),
}

impl ConfigRequest {
    pub fn change_bit(&self) -> ChangeMask {
        match self {
            ConfigRequest::Prep(_) => ChangeMask::PREP,
            ConfigRequest::Rc(_) => ChangeMask::RC,
            ConfigRequest::Codec(_) => ChangeMask::CODEC,
            ConfigRequest::Sei(_) => ChangeMask::SEI,
        }
    }
}

/// Primitive code carrying one change bit's record.
pub fn change_primitive(bit: ChangeMask) -> Option<PrimitiveCode> {
    if bit == ChangeMask::PREP {
        Some(PrimitiveCode::ControlPrep)
    } else if bit == ChangeMask::RC {
        Some(PrimitiveCode::ControlRc)
    } else if bit == ChangeMask::CODEC {
        Some(PrimitiveCode::ControlCodec)
    } else if bit == ChangeMask::SEI {
        Some(PrimitiveCode::ControlSei)
    } else {
        None
    }
}

/// The client's current configuration plus the change accumulator.
#[derive(Debug, Clone)]
pub struct ConfigSet {
    pub prep: PrepConfig,
    pub rc: RcConfig,
    pub codec: CodecConfig,
    pub sei: SeiMode,
    pending: ChangeMask,
}

impl ConfigSet {
    pub fn new(codec: CodecKind) -> Self {
        Self {
            prep: PrepConfig::default(),
            rc: RcConfig::default(),
            codec: CodecConfig::for_codec(codec),
            sei: SeiMode::default(),
            pending: ChangeMask::empty(),
        }
    }

    /// Store a request and mark its record pending. A request for a record
    /// that is still pending merges into it by change bits, so fields set by
    /// an undelivered request survive a later one.
    pub fn record(&mut self, request: ConfigRequest) -> Result<(), ConfigError> {
        let bit = request.change_bit();
        let pending = self.pending.contains(bit);
        match request {
            ConfigRequest::Prep(prep) if pending => self.prep.merge_from(&prep),
            ConfigRequest::Prep(prep) => self.prep = prep,
            ConfigRequest::Rc(rc) => {
                let change = if pending { self.rc.change | rc.change } else { rc.change };
                self.rc = RcConfig { change, ..rc };
            }
            ConfigRequest::Codec(codec) => {
                if codec.kind() != self.codec.kind() {
                    return Err(ConfigError::CodecMismatch {
                        expected: self.codec.kind(),
                        got: codec.kind(),
                    });
                }
                match (&mut self.codec, codec) {
                    (CodecConfig::H264(dst), CodecConfig::H264(src)) if pending => {
                        dst.merge_from(&src)
                    }
                    (CodecConfig::Jpeg(dst), CodecConfig::Jpeg(src)) if pending => {
                        if src.change.contains(JpegChange::QUANT) {
                            dst.quant = src.quant;
                        }
                        dst.change |= src.change;
                    }
                    (dst, _) => *dst = codec,
                }
            }
            ConfigRequest::Sei(sei) => self.sei = sei,
        }
        self.pending |= bit;
        Ok(())
    }

    pub fn pending(&self) -> ChangeMask {
        self.pending
    }

    /// Mark one record delivered.
    pub fn clear(&mut self, bit: ChangeMask) {
        self.pending.remove(bit);
    }

    /// Wire payload of the record behind `bit`.
    pub fn encoded(&self, bit: ChangeMask) -> Vec<u8> {
        if bit == ChangeMask::PREP {
            self.prep.encode().to_vec()
        } else if bit == ChangeMask::RC {
            self.rc.encode().to_vec()
        } else if bit == ChangeMask::CODEC {
            self.codec.encode()
        } else if bit == ChangeMask::SEI {
            self.sei.encode().to_vec()
        } else {
            Vec::new()
        }
    }
}

/// Configuration the engine host has applied for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedConfig {
    pub prep: PrepConfig,
    pub rc: RcConfig,
    pub codec: CodecConfig,
    pub sei: SeiMode,
}

impl AppliedConfig {
    pub fn new(codec: CodecKind) -> Self {
        Self {
            prep: PrepConfig::default(),
            rc: RcConfig::default(),
            codec: CodecConfig::for_codec(codec),
            sei: SeiMode::default(),
        }
    }

    /// Clear accumulated change bits once an encode consumed them.
    pub fn clear_changes(&mut self) {
        self.prep.change = PrepChange::empty();
        self.rc.change = 0;
        match &mut self.codec {
            CodecConfig::H264(cfg) => cfg.change = H264Change::empty(),
            CodecConfig::Jpeg(cfg) => cfg.change = JpegChange::empty(),
        }
    }
}
