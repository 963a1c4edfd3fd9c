//! Typed property registry.
//!
//! DCAM exposes camera capabilities as numeric property IDs with attributes
//! (range, step, unit, read/write flags, enumerated options). This module maps
//! the IDs the core relies on to a closed [`PropertyId`] enum and validates
//! writes against the device's [`PropertyDescriptor`]s before anything reaches
//! the driver.
//!
//! Properties can be addressed by snake_case name (`"exposure_time"`), by DCAM
//! display name (`"EXPOSURE TIME"`), by numeric ID (`0x001F0110`) or by enum.
//!
//! ## Mutability during capture
//!
//! While a stream is armed or running only descriptors flagged `capture_safe`
//! accept writes. By default that is exposure time, the sensor cooler and
//! defect correction. Geometry-affecting properties (binning, subarray, pixel
//! type, sensor mode) never are, since the ring was sized from them.

use crate::error::{DcamError, DcamResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// DCAM property identifiers known to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyId {
    /// Internal, external or software trigger.
    TriggerSource,
    /// Normal or start trigger.
    TriggerMode,
    /// Edge polarity of the external trigger.
    TriggerPolarity,
    /// Seconds. Writable during capture.
    ExposureTime,
    /// Read-only, degrees Celsius.
    SensorTemperature,
    /// Cooler on or off.
    SensorCooler,
    /// Slow (low noise) or fast.
    ReadoutSpeed,
    /// Area or light-sheet readout.
    SensorMode,
    /// 1x1, 2x2 or 4x4; changes the frame geometry.
    Binning,
    /// Left edge of the region of interest.
    SubarrayHpos,
    /// Width of the region of interest.
    SubarrayHsize,
    /// Top edge of the region of interest.
    SubarrayVpos,
    /// Height of the region of interest.
    SubarrayVsize,
    /// Whether the region of interest applies.
    SubarrayMode,
    /// Read-only, seconds per frame readout.
    TimingReadoutTime,
    /// Read-only, frames per second on the internal trigger.
    InternalFrameRate,
    /// Read-only, seconds between internal triggers.
    InternalFrameInterval,
    /// Who stamps frame times (none, DCAM module, camera).
    TimeStampProducer,
    /// Who stamps frame sequence numbers.
    FrameStampProducer,
    /// Read-only ADC depth.
    BitsPerChannel,
    /// Read-only, derived from subarray and binning.
    ImageWidth,
    /// Read-only, derived from subarray and binning.
    ImageHeight,
    /// Read-only.
    ImageRowbytes,
    /// Read-only.
    ImageFramebytes,
    /// MONO8, MONO16 and friends; see [`PixelType`].
    ImagePixelType,
    /// Read-only size the driver expects per buffer.
    BufferFramebytes,
    /// Micrometres.
    ImageDetectorPixelWidth,
    /// Micrometres.
    ImageDetectorPixelHeight,
    /// Hot pixel correction on or off.
    DefectCorrectMode,
}

// (id, DCAM code, DCAM display name)
const PROPERTY_TABLE: &[(PropertyId, u32, &str)] = &[
    (PropertyId::TriggerSource, 0x0010_0110, "TRIGGER SOURCE"),
    (PropertyId::TriggerMode, 0x0010_0210, "TRIGGER MODE"),
    (PropertyId::TriggerPolarity, 0x0010_0220, "TRIGGER POLARITY"),
    (PropertyId::ExposureTime, 0x001F_0110, "EXPOSURE TIME"),
    (PropertyId::SensorTemperature, 0x0020_0310, "SENSOR TEMPERATURE"),
    (PropertyId::SensorCooler, 0x0020_0320, "SENSOR COOLER"),
    (PropertyId::ReadoutSpeed, 0x0040_0110, "READOUT SPEED"),
    (PropertyId::SensorMode, 0x0040_0210, "SENSOR MODE"),
    (PropertyId::Binning, 0x0040_1110, "BINNING"),
    (PropertyId::SubarrayHpos, 0x0040_2110, "SUBARRAY HPOS"),
    (PropertyId::SubarrayHsize, 0x0040_2120, "SUBARRAY HSIZE"),
    (PropertyId::SubarrayVpos, 0x0040_2130, "SUBARRAY VPOS"),
    (PropertyId::SubarrayVsize, 0x0040_2140, "SUBARRAY VSIZE"),
    (PropertyId::SubarrayMode, 0x0040_2150, "SUBARRAY MODE"),
    (PropertyId::TimingReadoutTime, 0x0040_3010, "TIMING READOUT TIME"),
    (PropertyId::InternalFrameRate, 0x0040_3810, "INTERNAL FRAME RATE"),
    (PropertyId::InternalFrameInterval, 0x0040_3820, "INTERNAL FRAME INTERVAL"),
    (PropertyId::TimeStampProducer, 0x0041_0A10, "TIME STAMP PRODUCER"),
    (PropertyId::FrameStampProducer, 0x0041_0A20, "FRAME STAMP PRODUCER"),
    (PropertyId::BitsPerChannel, 0x0042_0130, "BITS PER CHANNEL"),
    (PropertyId::ImageWidth, 0x0042_0210, "IMAGE WIDTH"),
    (PropertyId::ImageHeight, 0x0042_0220, "IMAGE HEIGHT"),
    (PropertyId::ImageRowbytes, 0x0042_0230, "IMAGE ROWBYTES"),
    (PropertyId::ImageFramebytes, 0x0042_0240, "IMAGE FRAMEBYTES"),
    (PropertyId::ImagePixelType, 0x0042_0270, "IMAGE PIXEL TYPE"),
    (PropertyId::BufferFramebytes, 0x0042_0340, "BUFFER FRAMEBYTES"),
    (PropertyId::ImageDetectorPixelWidth, 0x0042_0810, "IMAGE DETECTOR PIXEL WIDTH"),
    (PropertyId::ImageDetectorPixelHeight, 0x0042_0820, "IMAGE DETECTOR PIXEL HEIGHT"),
    (PropertyId::DefectCorrectMode, 0x0047_0010, "DEFECT CORRECT MODE"),
];

fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

impl PropertyId {
    /// Every known property, in DCAM code order.
    pub fn all() -> impl Iterator<Item = PropertyId> {
        PROPERTY_TABLE.iter().map(|(id, _, _)| *id)
    }

    fn entry(self) -> &'static (PropertyId, u32, &'static str) {
        // The table lists every variant; the fallback is unreachable in practice.
        PROPERTY_TABLE
            .iter()
            .find(|(id, _, _)| *id == self)
            .unwrap_or(&PROPERTY_TABLE[0])
    }

    /// Numeric DCAM property ID.
    pub fn code(self) -> u32 {
        self.entry().1
    }

    /// DCAM display name, e.g. `EXPOSURE TIME`.
    pub fn display_name(self) -> &'static str {
        self.entry().2
    }

    /// Canonical snake_case name, e.g. `exposure_time`.
    pub fn name(self) -> String {
        normalize(self.display_name())
    }

    /// Inverse of [`PropertyId::code`].
    pub fn from_code(code: u32) -> Option<PropertyId> {
        PROPERTY_TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(id, _, _)| *id)
    }

    /// Case-insensitive lookup. Spaces, hyphens and underscores are
    /// interchangeable and may be omitted altogether (`exposuretime`).
    pub fn from_name(name: &str) -> Option<PropertyId> {
        let wanted = normalize(name);
        let compact: String = wanted.chars().filter(|c| *c != '_').collect();
        PROPERTY_TABLE.iter().map(|(id, _, _)| *id).find(|id| {
            let name = id.name();
            name == wanted || name.replace('_', "") == compact
        })
    }

    /// Whether changing the property changes the frame size or layout.
    pub fn affects_geometry(self) -> bool {
        matches!(
            self,
            PropertyId::Binning
                | PropertyId::SubarrayHpos
                | PropertyId::SubarrayHsize
                | PropertyId::SubarrayVpos
                | PropertyId::SubarrayVsize
                | PropertyId::SubarrayMode
                | PropertyId::ImagePixelType
                | PropertyId::SensorMode
        )
    }

    /// Writable properties that may change while frames are flowing.
    pub fn default_capture_safe(self) -> bool {
        matches!(
            self,
            PropertyId::ExposureTime | PropertyId::SensorCooler | PropertyId::DefectCorrectMode
        )
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for PropertyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Any way of naming a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    /// A known ID.
    Id(PropertyId),
    /// Snake_case or DCAM display name.
    Name(String),
    /// Numeric DCAM ID.
    Code(u32),
}

impl PropertyKey {
    /// Resolve to a known ID, or fail with `UnknownProperty`.
    pub fn resolve(&self) -> DcamResult<PropertyId> {
        match self {
            PropertyKey::Id(id) => Some(*id),
            PropertyKey::Name(name) => PropertyId::from_name(name),
            PropertyKey::Code(code) => PropertyId::from_code(*code),
        }
        .ok_or_else(|| DcamError::UnknownProperty(self.to_string()))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Id(id) => write!(f, "{}", id),
            PropertyKey::Name(name) => f.write_str(name),
            PropertyKey::Code(code) => write!(f, "0x{:08X}", code),
        }
    }
}

impl From<PropertyId> for PropertyKey {
    fn from(id: PropertyId) -> Self {
        PropertyKey::Id(id)
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        PropertyKey::Name(name.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::Name(name)
    }
}

impl From<u32> for PropertyKey {
    fn from(code: u32) -> Self {
        PropertyKey::Code(code)
    }
}

/// DCAM value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    /// Floating point.
    Real,
    /// Integer; non-integral writes are rejected.
    Long,
    /// One of a declared set of options.
    Mode,
    /// Free text, read-only in practice.
    Text,
}

/// A property value as read from or written to the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Real and Long properties.
    Numeric(f64),
    /// Mode properties: the code and its label.
    Enumerated {
        /// Option code
        value: i32,
        /// Option label
        label: String,
    },
    /// Text properties, or a label to be resolved for Mode properties.
    Text(String),
}

impl PropertyValue {
    /// Numeric view of the value; enumerated values yield their code.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Numeric(v) => Some(*v),
            PropertyValue::Enumerated { value, .. } => Some(f64::from(*value)),
            PropertyValue::Text(_) => None,
        }
    }

    /// Text, or the label of an enumerated value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Enumerated { label, .. } => Some(label),
            PropertyValue::Numeric(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Numeric(v) if v.fract() == 0.0 && v.abs() < 1e15 => {
                write!(f, "{}", *v as i64)
            }
            PropertyValue::Numeric(v) => write!(f, "{}", v),
            PropertyValue::Enumerated { label, .. } => f.write_str(label),
            PropertyValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Numeric(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Numeric(f64::from(v))
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Numeric(f64::from(v))
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

/// Unit attached to a numeric property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Seconds
    Second,
    /// Degrees Celsius
    Celsius,
    /// Kelvin
    Kelvin,
    /// Metres per second
    MeterPerSecond,
    /// Hertz
    PerSecond,
    /// Angle in degrees
    Degree,
    /// Micrometres
    Micrometer,
    /// Dimensionless
    None,
}

impl Unit {
    /// Short symbol for tables; empty when dimensionless.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Second => "s",
            Unit::Celsius => "°C",
            Unit::Kelvin => "K",
            Unit::MeterPerSecond => "m/s",
            Unit::PerSecond => "1/s",
            Unit::Degree => "°",
            Unit::Micrometer => "µm",
            Unit::None => "",
        }
    }

    /// Convert a value expressed in this unit to SI (Kelvin, metre, ...).
    pub fn to_si(self, value: f64) -> f64 {
        match self {
            Unit::Celsius => value + 273.15,
            Unit::Micrometer => value * 1e-6,
            _ => value,
        }
    }
}

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// 8 bit grayscale
    Mono8,
    /// 16 bit grayscale, little endian
    Mono16,
    /// 12 bit grayscale, two pixels in three bytes
    Mono12,
    /// 12 bit grayscale, packed
    Mono12P,
    /// 8 bits per channel
    Rgb24,
    /// 8 bits per channel, blue first
    Bgr24,
    /// 16 bits per channel
    Rgb48,
    /// 16 bits per channel, blue first
    Bgr48,
}

impl PixelType {
    /// DCAM `DCAM_PIXELTYPE` value.
    pub fn code(self) -> i32 {
        match self {
            PixelType::Mono8 => 0x01,
            PixelType::Mono16 => 0x02,
            PixelType::Mono12 => 0x03,
            PixelType::Mono12P => 0x05,
            PixelType::Rgb24 => 0x21,
            PixelType::Rgb48 => 0x22,
            PixelType::Bgr24 => 0x29,
            PixelType::Bgr48 => 0x2A,
        }
    }

    /// Inverse of [`PixelType::code`].
    pub fn from_code(code: i32) -> Option<PixelType> {
        Self::all().into_iter().find(|p| p.code() == code)
    }

    /// Every supported layout.
    pub fn all() -> [PixelType; 8] {
        [
            PixelType::Mono8,
            PixelType::Mono16,
            PixelType::Mono12,
            PixelType::Mono12P,
            PixelType::Rgb24,
            PixelType::Rgb48,
            PixelType::Bgr24,
            PixelType::Bgr48,
        ]
    }

    /// Upper-case name as DCAM prints it, e.g. `MONO16`.
    pub fn label(self) -> &'static str {
        match self {
            PixelType::Mono8 => "MONO8",
            PixelType::Mono16 => "MONO16",
            PixelType::Mono12 => "MONO12",
            PixelType::Mono12P => "MONO12P",
            PixelType::Rgb24 => "RGB24",
            PixelType::Rgb48 => "RGB48",
            PixelType::Bgr24 => "BGR24",
            PixelType::Bgr48 => "BGR48",
        }
    }

    /// Bytes per pixel. 12-bit formats pack two pixels into three bytes.
    pub fn bytes_per_pixel(self) -> f64 {
        match self {
            PixelType::Mono8 => 1.0,
            PixelType::Mono16 => 2.0,
            PixelType::Mono12 | PixelType::Mono12P => 1.5,
            PixelType::Rgb24 | PixelType::Bgr24 => 3.0,
            PixelType::Rgb48 | PixelType::Bgr48 => 6.0,
        }
    }

    /// Bytes in one row of `width` pixels, rounded up to a whole byte.
    pub fn row_bytes(self, width: usize) -> usize {
        match self {
            PixelType::Mono12 | PixelType::Mono12P => (width * 3).div_ceil(2),
            other => width * other.bytes_per_pixel() as usize,
        }
    }

    /// Bytes needed for one `width` x `height` frame, without padding.
    pub fn frame_bytes(self, width: usize, height: usize) -> usize {
        self.row_bytes(width) * height
    }
}

/// One choice of an enumerated (Mode) property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnumOption {
    /// Code written to the device
    pub value: i32,
    /// Upper-case label
    pub label: String,
}

impl EnumOption {
    /// Option `value` labelled `label`.
    pub fn new(value: i32, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }
}

/// Capability descriptor for one property on one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDescriptor {
    /// Which property this describes
    pub id: PropertyId,
    /// Value type
    pub kind: PropertyKind,
    /// Unit of numeric values
    pub unit: Unit,
    /// Inclusive lower bound
    pub min: f64,
    /// Inclusive upper bound
    pub max: f64,
    /// Zero means any value in range is accepted.
    pub step: f64,
    /// Value after open
    pub default: f64,
    /// Readable through `get`
    pub readable: bool,
    /// Writable through `set`
    pub writable: bool,
    /// May be written while a stream is armed or running.
    pub capture_safe: bool,
    /// Declared choices of a Mode property; empty otherwise
    pub options: Vec<EnumOption>,
}

impl PropertyDescriptor {
    /// Writable numeric property.
    pub fn numeric(id: PropertyId, kind: PropertyKind, unit: Unit, min: f64, max: f64, step: f64, default: f64) -> Self {
        Self {
            id,
            kind,
            unit,
            min,
            max,
            step,
            default,
            readable: true,
            writable: true,
            capture_safe: id.default_capture_safe(),
            options: Vec::new(),
        }
    }

    /// Writable enumerated property; range and default follow the options.
    pub fn mode(id: PropertyId, options: Vec<EnumOption>, default: i32) -> Self {
        let min = options.iter().map(|o| o.value).min().unwrap_or(0);
        let max = options.iter().map(|o| o.value).max().unwrap_or(0);
        Self {
            id,
            kind: PropertyKind::Mode,
            unit: Unit::None,
            min: f64::from(min),
            max: f64::from(max),
            step: 0.0,
            default: f64::from(default),
            readable: true,
            writable: true,
            capture_safe: id.default_capture_safe(),
            options,
        }
    }

    /// Same descriptor with writes refused.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self.capture_safe = false;
        self
    }

    /// Canonical snake_case name.
    pub fn name(&self) -> String {
        self.id.name()
    }

    /// Whether writes change the frame layout and so are refused during capture.
    pub fn affects_geometry(&self) -> bool {
        self.id.affects_geometry()
    }

    /// The option for an enumerated code, if declared.
    pub fn option(&self, value: i32) -> Option<&EnumOption> {
        self.options.iter().find(|o| o.value == value)
    }

    /// Check `value` against type, range, step and options.
    ///
    /// Returns the normalized value to hand to the driver: enumerated
    /// properties accept a code or a label and always yield `Enumerated`.
    pub fn validate(&self, value: &PropertyValue) -> DcamResult<PropertyValue> {
        let name = self.name();
        match self.kind {
            PropertyKind::Text => match value {
                PropertyValue::Text(_) => Ok(value.clone()),
                _ => Err(DcamError::invalid_value(name, "expected a string")),
            },
            PropertyKind::Mode => {
                let found = match value {
                    PropertyValue::Text(label) => self
                        .options
                        .iter()
                        .find(|o| o.label.eq_ignore_ascii_case(label.trim())),
                    PropertyValue::Enumerated { value, .. } => self.option(*value),
                    PropertyValue::Numeric(v) if v.fract() == 0.0 => self.option(*v as i32),
                    PropertyValue::Numeric(_) => None,
                };
                found
                    .map(|o| PropertyValue::Enumerated {
                        value: o.value,
                        label: o.label.clone(),
                    })
                    .ok_or_else(|| {
                        let labels: Vec<&str> = self.options.iter().map(|o| o.label.as_str()).collect();
                        DcamError::invalid_value(
                            name,
                            format!("'{}' is not one of: {}", value, labels.join(", ")),
                        )
                    })
            }
            PropertyKind::Real | PropertyKind::Long => {
                let v = match value {
                    PropertyValue::Numeric(v) => *v,
                    _ => return Err(DcamError::invalid_value(name, "expected a number")),
                };
                if !v.is_finite() {
                    return Err(DcamError::invalid_value(name, "value is not finite"));
                }
                if self.kind == PropertyKind::Long && v.fract() != 0.0 {
                    return Err(DcamError::invalid_value(name, format!("{} is not an integer", v)));
                }
                if v < self.min || v > self.max {
                    return Err(DcamError::invalid_value(
                        name,
                        format!("{} is outside [{}, {}]", v, self.min, self.max),
                    ));
                }
                if self.step > 0.0 {
                    let steps = (v - self.min) / self.step;
                    if (steps - steps.round()).abs() > 1e-9 * steps.abs().max(1.0) {
                        return Err(DcamError::invalid_value(
                            name,
                            format!("{} is not on a step of {} from {}", v, self.step, self.min),
                        ));
                    }
                }
                Ok(PropertyValue::Numeric(v))
            }
        }
    }
}

/// One row of [`PropertyRegistry`] listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyEntry {
    /// Canonical snake_case name
    pub name: String,
    /// `None` for write-only properties.
    pub value: Option<PropertyValue>,
    /// Capabilities of the property
    pub descriptor: PropertyDescriptor,
}

/// Capability descriptor of an open device plus the last value seen per property.
#[derive(Debug)]
pub struct PropertyRegistry {
    descriptors: Vec<PropertyDescriptor>,
    index: HashMap<PropertyId, usize>,
    cache: Mutex<HashMap<PropertyId, PropertyValue>>,
}

impl PropertyRegistry {
    /// Registry over a device's capability descriptor.
    pub fn new(descriptors: Vec<PropertyDescriptor>) -> Self {
        let index = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id, i))
            .collect();
        Self {
            descriptors,
            index,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Descriptor for `key`. Fails with `UnknownProperty` when the key names
    /// nothing, or names a property this device does not have.
    pub fn descriptor(&self, key: &PropertyKey) -> DcamResult<&PropertyDescriptor> {
        let id = key.resolve()?;
        self.index
            .get(&id)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| DcamError::UnknownProperty(key.to_string()))
    }

    /// Whether the device has the property.
    pub fn contains(&self, key: impl Into<PropertyKey>) -> bool {
        self.descriptor(&key.into()).is_ok()
    }

    /// Descriptors in the order the driver reported them.
    pub fn descriptors(&self) -> &[PropertyDescriptor] {
        &self.descriptors
    }

    /// Number of properties the device has.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True only for a device reporting no properties.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Validate a write without touching the device.
    ///
    /// `capturing` is true while a stream is armed or running.
    pub fn check_write(
        &self,
        key: &PropertyKey,
        value: &PropertyValue,
        capturing: bool,
    ) -> DcamResult<(&PropertyDescriptor, PropertyValue)> {
        let descriptor = self.descriptor(key)?;
        if !descriptor.writable {
            return Err(DcamError::ReadOnlyProperty(descriptor.name()));
        }
        if capturing && !descriptor.capture_safe {
            return Err(DcamError::NotMutableWhileCapturing(descriptor.name()));
        }
        let normalized = descriptor.validate(value)?;
        Ok((descriptor, normalized))
    }

    /// Remember the value last read from or applied to the device.
    pub fn record(&self, id: PropertyId, value: PropertyValue) {
        self.cache.lock().insert(id, value);
    }

    /// Last value seen for `key`, without asking the device.
    pub fn cached(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        let id = key.into().resolve().ok()?;
        self.cache.lock().get(&id).cloned()
    }

    /// Drop cached values of properties derived from geometry.
    pub fn invalidate_derived(&self) {
        self.cache.lock().retain(|id, _| {
            !matches!(
                id,
                PropertyId::ImageWidth
                    | PropertyId::ImageHeight
                    | PropertyId::ImageRowbytes
                    | PropertyId::ImageFramebytes
                    | PropertyId::BufferFramebytes
                    | PropertyId::TimingReadoutTime
                    | PropertyId::InternalFrameRate
                    | PropertyId::InternalFrameInterval
            )
        });
    }
}
