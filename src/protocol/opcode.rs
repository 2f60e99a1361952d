//! Operation codes for both directions of the control channel.
//!
//! The two enumerations are closed sets shared with the PHP bootstrap; the
//! numeric values here and in `bootstrap.php` must stay in lock-step.

/// Host-to-PHP request opcodes, assigned consecutively from 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    /// Reply to a reverse request (flags + payload).
    Data = 0,
    /// Read a constant by namespace-qualified name.
    Const = 1,
    /// Read a global variable, optionally through an index path.
    Get = 2,
    /// Read a global variable as an object handle.
    GetThis = 3,
    /// Write a global variable (JSON value).
    Set = 4,
    /// Write a global variable (host handle).
    SetInst = 5,
    /// Write through an index path (JSON value).
    SetPath = 6,
    /// Write through an index path (host handle).
    SetPathInst = 7,
    /// Unset a global variable.
    Unset = 8,
    /// Unset through an index path.
    UnsetPath = 9,
    ClassStaticGet = 10,
    ClassStaticGetThis = 11,
    ClassStaticSet = 12,
    ClassStaticSetInst = 13,
    ClassStaticSetPath = 14,
    ClassStaticSetPathInst = 15,
    ClassStaticUnset = 16,
    /// Construct a PHP object, returning a handle.
    Construct = 17,
    /// Release a PHP-side handle. Fire-and-forget: no result record follows.
    Destruct = 18,
    ClassGet = 19,
    ClassGetThis = 20,
    ClassSet = 21,
    ClassSetInst = 22,
    ClassSetPath = 23,
    ClassSetPathInst = 24,
    ClassUnset = 25,
    ClassUnsetPath = 26,
    /// Call a method on a handle.
    ClassCall = 27,
    /// Call a method reached through a property path.
    ClassCallPath = 28,
    /// Invoke a handle as a callable.
    ClassInvoke = 29,
    ClassIterateBegin = 30,
    ClassIterate = 31,
    /// Destruct every PHP-side handle allocated after the given marker.
    PopFrame = 32,
    /// Query the number of live PHP-side handles.
    NObjects = 33,
    /// Ask PHP to emit the stdout sentinel.
    EndStdout = 34,
    /// Call a function, returning its value.
    Call = 35,
    /// Call a function, returning a handle to its result.
    CallThis = 36,
    CallEval = 37,
    CallEvalThis = 38,
    CallEcho = 39,
    CallInclude = 40,
    CallIncludeOnce = 41,
    CallRequire = 42,
    CallRequireOnce = 43,
}

/// PHP-to-host reverse request opcodes, assigned consecutively from 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ReverseOp {
    /// A script error occurred; payload is the JSON 4-tuple
    /// `[file, line, message, trace]`.
    Error = 1,
    /// Resolve a host class symbol by name.
    GetClass = 2,
    /// Construct a host instance of a previously resolved class.
    Construct = 3,
    /// Release a host-side handle. Fire-and-forget: no `DATA` reply.
    Destruct = 4,
    ClassGet = 5,
    ClassSet = 6,
    ClassCall = 7,
    ClassInvoke = 8,
    ClassGetIterator = 9,
    ClassToString = 10,
    ClassIsset = 11,
    ClassUnset = 12,
    /// Enumerate the property names of a host instance.
    ClassProps = 13,
    /// Call a static method on a resolved host class.
    ClassStaticCall = 14,
    /// Call a host function (target 0 resolves through the host globals).
    Call = 15,
    /// JSON-encode a host value.
    JsonEncode = 16,
}

impl ReverseOp {
    /// Decode a reverse opcode from its wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        use ReverseOp::*;
        Some(match v {
            1 => Error,
            2 => GetClass,
            3 => Construct,
            4 => Destruct,
            5 => ClassGet,
            6 => ClassSet,
            7 => ClassCall,
            8 => ClassInvoke,
            9 => ClassGetIterator,
            10 => ClassToString,
            11 => ClassIsset,
            12 => ClassUnset,
            13 => ClassProps,
            14 => ClassStaticCall,
            15 => Call,
            16 => JsonEncode,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_opcode_table() {
        // Spot-check the assignments the bootstrap depends on.
        assert_eq!(Opcode::Data as i32, 0);
        assert_eq!(Opcode::Construct as i32, 17);
        assert_eq!(Opcode::ClassIterate as i32, 31);
        assert_eq!(Opcode::PopFrame as i32, 32);
        assert_eq!(Opcode::NObjects as i32, 33);
        assert_eq!(Opcode::EndStdout as i32, 34);
        assert_eq!(Opcode::CallRequireOnce as i32, 43);
    }

    #[test]
    fn test_reverse_opcode_round_trip() {
        for v in 1..=16u32 {
            let op = ReverseOp::from_u32(v).expect("known opcode");
            assert_eq!(op as u32, v);
        }
        assert!(ReverseOp::from_u32(0).is_none());
        assert!(ReverseOp::from_u32(17).is_none());
    }
}
