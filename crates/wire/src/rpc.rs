//! RPC calls: named methods with ordered, typed arguments.
//!
//! Every method the host or a controller understands is listed in
//! [`method`] together with its argument schema ([`schema`]). Calls are
//! validated against the schema before a handler sees them, so handlers can
//! use the typed accessors without re-checking arity.

use std::fmt;

use navi_pose::{Quat, Vec3};

use crate::rpc_arg_proto::Value;
use crate::{DecodeError, RpcArgProto, RpcCallProto};

use ArgKind::{Blob, Bool, Float, Int, Str};

// ============================================================================
// Arguments
// ============================================================================

/// Kind of an RPC argument, used for schema checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Float,
    Bool,
    Str,
    Blob,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Str => "string",
            Self::Blob => "bytes",
        };
        f.write_str(name)
    }
}

/// One RPC argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcArg {
    Int(i32),
    Float(f32),
    Bool(bool),
    Str(String),
    Blob(Vec<u8>),
}

impl RpcArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Int(_) => ArgKind::Int,
            Self::Float(_) => ArgKind::Float,
            Self::Bool(_) => ArgKind::Bool,
            Self::Str(_) => ArgKind::Str,
            Self::Blob(_) => ArgKind::Blob,
        }
    }
}

impl From<i32> for RpcArg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for RpcArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for RpcArg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for RpcArg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for RpcArg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for RpcArg {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<RpcArg> for RpcArgProto {
    fn from(arg: RpcArg) -> Self {
        let value = match arg {
            RpcArg::Int(v) => Value::Int(v),
            RpcArg::Float(v) => Value::Float(v),
            RpcArg::Bool(v) => Value::Bool(v),
            RpcArg::Str(v) => Value::Str(v),
            RpcArg::Blob(v) => Value::Blob(v),
        };
        RpcArgProto { value: Some(value) }
    }
}

// ============================================================================
// Calls
// ============================================================================

/// A decoded RPC call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub method: String,
    pub args: Vec<RpcArg>,
}

impl From<RpcCall> for RpcCallProto {
    fn from(call: RpcCall) -> Self {
        RpcCallProto {
            method: call.method,
            args: call.args.into_iter().map(RpcArgProto::from).collect(),
        }
    }
}

impl TryFrom<RpcCallProto> for RpcCall {
    type Error = DecodeError;

    fn try_from(proto: RpcCallProto) -> Result<Self, Self::Error> {
        let mut args = Vec::with_capacity(proto.args.len());
        for (index, arg) in proto.args.into_iter().enumerate() {
            let value = arg.value.ok_or_else(|| DecodeError::MissingValue {
                method: proto.method.clone(),
                index,
            })?;
            args.push(match value {
                Value::Int(v) => RpcArg::Int(v),
                Value::Float(v) => RpcArg::Float(v),
                Value::Bool(v) => RpcArg::Bool(v),
                Value::Str(v) => RpcArg::Str(v),
                Value::Blob(v) => RpcArg::Blob(v),
            });
        }
        Ok(RpcCall {
            method: proto.method,
            args,
        })
    }
}

impl RpcCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<RpcArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Check argument count and kinds against `schema`.
    pub fn validate(&self, schema: &[ArgKind]) -> Result<(), DecodeError> {
        if self.args.len() != schema.len() {
            return Err(DecodeError::ArgCount {
                method: self.method.clone(),
                expected: schema.len(),
                actual: self.args.len(),
            });
        }
        for (index, (arg, &expected)) in self.args.iter().zip(schema).enumerate() {
            if arg.kind() != expected {
                return Err(DecodeError::ArgType {
                    method: self.method.clone(),
                    index,
                    expected,
                    actual: arg.kind(),
                });
            }
        }
        Ok(())
    }

    fn get(&self, index: usize) -> Result<&RpcArg, DecodeError> {
        self.args.get(index).ok_or_else(|| DecodeError::ArgCount {
            method: self.method.clone(),
            expected: index + 1,
            actual: self.args.len(),
        })
    }

    fn type_error(&self, index: usize, expected: ArgKind, actual: &RpcArg) -> DecodeError {
        DecodeError::ArgType {
            method: self.method.clone(),
            index,
            expected,
            actual: actual.kind(),
        }
    }

    pub fn int(&self, index: usize) -> Result<i32, DecodeError> {
        match self.get(index)? {
            RpcArg::Int(v) => Ok(*v),
            other => Err(self.type_error(index, ArgKind::Int, other)),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32, DecodeError> {
        match self.get(index)? {
            RpcArg::Float(v) => Ok(*v),
            other => Err(self.type_error(index, ArgKind::Float, other)),
        }
    }

    pub fn bool(&self, index: usize) -> Result<bool, DecodeError> {
        match self.get(index)? {
            RpcArg::Bool(v) => Ok(*v),
            other => Err(self.type_error(index, ArgKind::Bool, other)),
        }
    }

    pub fn str(&self, index: usize) -> Result<&str, DecodeError> {
        match self.get(index)? {
            RpcArg::Str(v) => Ok(v),
            other => Err(self.type_error(index, ArgKind::Str, other)),
        }
    }

    pub fn blob(&self, index: usize) -> Result<&[u8], DecodeError> {
        match self.get(index)? {
            RpcArg::Blob(v) => Ok(v),
            other => Err(self.type_error(index, ArgKind::Blob, other)),
        }
    }

    /// Non-negative int argument converted to a size or offset.
    pub fn index(&self, index: usize) -> Result<usize, DecodeError> {
        let value = self.int(index)?;
        usize::try_from(value).map_err(|_| DecodeError::ArgRange {
            method: self.method.clone(),
            index,
        })
    }
}

// ============================================================================
// Method table
// ============================================================================

/// Method names as they travel on the wire.
pub mod method {
    /// Host → controller: assigned role, 0-based.
    pub const ASSIGN_ROLE: &str = "DeviceNo";
    /// Host → controller: host SDK build number.
    pub const BUILD_NO: &str = "BuildNo";
    /// Host → controller: instruction text to display.
    pub const SET_INSTRUCTION: &str = "SetInstruction";
    /// Host → controller: vibrate once.
    pub const VIBRATE: &str = "Vibrate";
    /// Host → controller: orientation code, and whether the user may rotate
    /// the device away from it.
    pub const SET_ORIENTATION: &str = "SetOrientation";
    pub const OPEN_KEYBOARD: &str = "OpenKeyboard";
    pub const CLOSE_KEYBOARD: &str = "CloseKeyboard";
    pub const CLEAR_KEYBOARD: &str = "ClearKeyboard";
    pub const SET_KEYBOARD_TEXT: &str = "SetKeyboardText";
    /// Controller → host: text entered on the soft keyboard.
    pub const KEYBOARD_TEXT: &str = "KeyboardText";
    /// Controller → host: screen width and height. Completes the handshake.
    pub const SET_SIZE: &str = "SetSize";
    /// Controller → host: platform code.
    pub const SET_PLATFORM: &str = "SetPlatform";
    pub const SET_LOCATION: &str = "SetLocation";
    pub const SET_ROTATION: &str = "SetRotation";
    pub const ANIMATE_TO: &str = "AnimateTo";
    pub const SET_RENDERER_ENABLED: &str = "SetRendererEnabled";
    pub const DESTROY: &str = "Destroy";
    pub const DUPLICATE: &str = "Duplicate";
    /// Host → controller: total bundle length in bytes.
    pub const ASSET_START: &str = "AssetStart";
    /// Host → controller: byte offset and chunk bytes.
    pub const ASSET_CHUNK: &str = "AssetChunk";
    /// Host → controller: lowercase hex SHA-256 of the whole bundle.
    pub const ASSET_COMPLETE: &str = "AssetComplete";
    /// Host → controller: PNG bytes shown behind the touch surface.
    pub const SET_IMAGE: &str = "SetImage";
}

/// Argument schema for a known method, `None` for unknown methods.
pub fn schema(name: &str) -> Option<&'static [ArgKind]> {
    let kinds: &'static [ArgKind] = match name {
        method::ASSIGN_ROLE | method::BUILD_NO | method::SET_PLATFORM | method::ASSET_START => {
            &[Int]
        }
        method::SET_INSTRUCTION
        | method::SET_KEYBOARD_TEXT
        | method::KEYBOARD_TEXT
        | method::DESTROY
        | method::ASSET_COMPLETE => &[Str],
        method::VIBRATE
        | method::OPEN_KEYBOARD
        | method::CLOSE_KEYBOARD
        | method::CLEAR_KEYBOARD => &[],
        method::SET_ORIENTATION => &[Int, Bool],
        method::SET_SIZE => &[Int, Int],
        method::SET_LOCATION => &[Str, Float, Float, Float],
        method::SET_ROTATION => &[Str, Float, Float, Float, Float],
        method::ANIMATE_TO => &[Str, Float, Float, Float, Float],
        method::SET_RENDERER_ENABLED => &[Str, Bool],
        method::DUPLICATE => &[Str, Str],
        method::ASSET_CHUNK => &[Int, Blob],
        method::SET_IMAGE => &[Blob],
        _ => return None,
    };
    Some(kinds)
}

impl RpcCall {
    pub fn assign_role(role: i32) -> Self {
        Self::new(method::ASSIGN_ROLE).arg(role)
    }

    pub fn build_no(build: i32) -> Self {
        Self::new(method::BUILD_NO).arg(build)
    }

    pub fn set_instruction(text: impl Into<String>) -> Self {
        Self::new(method::SET_INSTRUCTION).arg(text.into())
    }

    pub fn vibrate() -> Self {
        Self::new(method::VIBRATE)
    }

    pub fn set_orientation(code: i32, user_can_override: bool) -> Self {
        Self::new(method::SET_ORIENTATION)
            .arg(code)
            .arg(user_can_override)
    }

    pub fn set_image(png: Vec<u8>) -> Self {
        Self::new(method::SET_IMAGE).arg(png)
    }

    pub fn set_size(width: i32, height: i32) -> Self {
        Self::new(method::SET_SIZE).arg(width).arg(height)
    }

    pub fn set_platform(platform: i32) -> Self {
        Self::new(method::SET_PLATFORM).arg(platform)
    }

    pub fn keyboard_text(text: impl Into<String>) -> Self {
        Self::new(method::KEYBOARD_TEXT).arg(text.into())
    }

    pub fn set_keyboard_text(text: impl Into<String>) -> Self {
        Self::new(method::SET_KEYBOARD_TEXT).arg(text.into())
    }

    pub fn open_keyboard() -> Self {
        Self::new(method::OPEN_KEYBOARD)
    }

    pub fn close_keyboard() -> Self {
        Self::new(method::CLOSE_KEYBOARD)
    }

    pub fn clear_keyboard() -> Self {
        Self::new(method::CLEAR_KEYBOARD)
    }

    pub fn set_location(object: impl Into<String>, position: Vec3) -> Self {
        Self::new(method::SET_LOCATION)
            .arg(object.into())
            .arg(position.x)
            .arg(position.y)
            .arg(position.z)
    }

    pub fn set_rotation(object: impl Into<String>, rotation: Quat) -> Self {
        Self::new(method::SET_ROTATION)
            .arg(object.into())
            .arg(rotation.x)
            .arg(rotation.y)
            .arg(rotation.z)
            .arg(rotation.w)
    }

    pub fn animate_to(object: impl Into<String>, position: Vec3, duration_secs: f32) -> Self {
        Self::new(method::ANIMATE_TO)
            .arg(object.into())
            .arg(position.x)
            .arg(position.y)
            .arg(position.z)
            .arg(duration_secs)
    }

    pub fn set_renderer_enabled(object: impl Into<String>, enabled: bool) -> Self {
        Self::new(method::SET_RENDERER_ENABLED)
            .arg(object.into())
            .arg(enabled)
    }

    pub fn destroy(object: impl Into<String>) -> Self {
        Self::new(method::DESTROY).arg(object.into())
    }

    pub fn duplicate(object: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::new(method::DUPLICATE)
            .arg(object.into())
            .arg(new_name.into())
    }

    /// Read a `Vec3` from three consecutive float arguments.
    pub fn vec3(&self, start: usize) -> Result<Vec3, DecodeError> {
        Ok(Vec3::new(
            self.float(start)?,
            self.float(start + 1)?,
            self.float(start + 2)?,
        ))
    }

    pub fn asset_start(total_len: i32) -> Self {
        Self::new(method::ASSET_START).arg(total_len)
    }

    pub fn asset_chunk(offset: i32, bytes: Vec<u8>) -> Self {
        Self::new(method::ASSET_CHUNK).arg(offset).arg(bytes)
    }

    pub fn asset_complete(digest_hex: impl Into<String>) -> Self {
        Self::new(method::ASSET_COMPLETE).arg(digest_hex.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_match_schema() {
        let calls = [
            RpcCall::assign_role(1),
            RpcCall::build_no(1),
            RpcCall::set_instruction("hi"),
            RpcCall::vibrate(),
            RpcCall::set_orientation(3, true),
            RpcCall::set_size(1080, 1920),
            RpcCall::set_platform(2),
            RpcCall::keyboard_text("abc"),
            RpcCall::set_keyboard_text("abc"),
            RpcCall::asset_start(10),
            RpcCall::asset_chunk(0, vec![1, 2]),
            RpcCall::asset_complete("00ff"),
            RpcCall::open_keyboard(),
            RpcCall::close_keyboard(),
            RpcCall::clear_keyboard(),
            RpcCall::set_location("cube", Vec3::new(1.0, 2.0, 3.0)),
            RpcCall::set_rotation("cube", Quat::IDENTITY),
            RpcCall::animate_to("cube", Vec3::ZERO, 0.5),
            RpcCall::set_renderer_enabled("cube", false),
            RpcCall::destroy("cube"),
            RpcCall::duplicate("cube", "cube2"),
            RpcCall::set_image(vec![0x89, b'P', b'N', b'G']),
        ];
        for call in calls {
            let kinds = schema(&call.method).unwrap();
            call.validate(kinds).unwrap();
        }
    }

    #[test]
    fn test_set_image_carries_png_bytes() {
        let png = vec![0x89, b'P', b'N', b'G', 0, 1, 2];
        let call = RpcCall::set_image(png.clone());
        call.validate(schema(method::SET_IMAGE).unwrap()).unwrap();
        assert_eq!(call.blob(0).unwrap(), &png[..]);
    }

    #[test]
    fn test_unknown_method_has_no_schema() {
        assert!(schema("TouchIO").is_none());
        assert!(schema("").is_none());
    }

    #[test]
    fn test_validate_arg_count() {
        let call = RpcCall::new(method::SET_SIZE).arg(1);
        let err = call.validate(schema(method::SET_SIZE).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ArgCount {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_arg_type() {
        let call = RpcCall::new(method::ASSIGN_ROLE).arg("zero");
        let err = call.validate(schema(method::ASSIGN_ROLE).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ArgType {
                index: 0,
                expected: ArgKind::Int,
                actual: ArgKind::Str,
                ..
            }
        ));
    }

    #[test]
    fn test_typed_accessors() {
        let call = RpcCall::new(method::SET_LOCATION)
            .arg("cube")
            .arg(1.0f32)
            .arg(2.0f32)
            .arg(3.0f32);
        assert_eq!(call.str(0).unwrap(), "cube");
        assert_eq!(call.float(2).unwrap(), 2.0);
        assert!(call.int(1).is_err());
        assert!(call.float(4).is_err());
        assert_eq!(call.vec3(1).unwrap(), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_index_rejects_negative() {
        let call = RpcCall::asset_start(-5);
        assert!(matches!(
            call.index(0),
            Err(DecodeError::ArgRange { index: 0, .. })
        ));
        assert_eq!(RpcCall::asset_start(5).index(0).unwrap(), 5);
    }
}
