//! The module instruction set.
//!
//! Every opcode is one byte, optionally followed by a little-endian operand
//! of fixed width. Each opcode also has a fixed effect on the depth of the
//! operand stack, expressed in bytes, which the decoder uses to compute the
//! depth in front of every instruction without looking at control flow.

use core::fmt;

/// Calls the given macro with each opcode.
///
/// Every entry has the shape `Name = encoding, "mnemonic", operand_width,
/// stack_delta;` where `operand_width` is the size in bytes of the immediate
/// following the opcode and `stack_delta` is the change in operand-stack depth
/// (in bytes) caused by executing the instruction.
#[macro_export]
macro_rules! for_each_opcode {
    ( $macro:ident ) => {
        $macro! {
            /// Never emitted by a compiler; traps if executed.
            Undef = 0, "undef", 0, 0;
            /// Does nothing.
            Ignore = 1, "ignore", 0, 0;
            /// Debugger breakpoint; counted and otherwise ignored.
            Break = 2, "break", 0, 0;

            /// Open a procedure frame of `operand` bytes.
            Enter = 3, "enter", 4, 0;
            /// Close a procedure frame of `operand` bytes and return the top
            /// of the operand stack to the caller.
            Leave = 4, "leave", 4, -4;
            /// Call the procedure (or syscall, if negative) on top of the stack.
            Call = 5, "call", 0, 0;
            /// Push a zero.
            Push = 6, "push", 0, 4;
            /// Discard the top of the stack.
            Pop = 7, "pop", 0, -4;
            /// Push the immediate.
            Const = 8, "const", 4, 4;
            /// Push the address of a frame slot.
            Local = 9, "local", 4, 4;
            /// Jump to the instruction index on top of the stack.
            Jump = 10, "jump", 0, -4;

            /// Branch if `a == b`.
            Eq = 11, "eq", 4, -8;
            /// Branch if `a != b`.
            Ne = 12, "ne", 4, -8;
            /// Branch if signed `a < b`.
            Lti = 13, "lti", 4, -8;
            /// Branch if signed `a <= b`.
            Lei = 14, "lei", 4, -8;
            /// Branch if signed `a > b`.
            Gti = 15, "gti", 4, -8;
            /// Branch if signed `a >= b`.
            Gei = 16, "gei", 4, -8;
            /// Branch if unsigned `a < b`.
            Ltu = 17, "ltu", 4, -8;
            /// Branch if unsigned `a <= b`.
            Leu = 18, "leu", 4, -8;
            /// Branch if unsigned `a > b`.
            Gtu = 19, "gtu", 4, -8;
            /// Branch if unsigned `a >= b`.
            Geu = 20, "geu", 4, -8;
            /// Branch if float `a == b`.
            Eqf = 21, "eqf", 4, -8;
            /// Branch if float `a != b`.
            Nef = 22, "nef", 4, -8;
            /// Branch if float `a < b`.
            Ltf = 23, "ltf", 4, -8;
            /// Branch if float `a <= b`.
            Lef = 24, "lef", 4, -8;
            /// Branch if float `a > b`.
            Gtf = 25, "gtf", 4, -8;
            /// Branch if float `a >= b`.
            Gef = 26, "gef", 4, -8;

            /// `top = zero_extend(load8(top))`
            Load1 = 27, "load1", 0, 0;
            /// `top = zero_extend(load16_le(top))`
            Load2 = 28, "load2", 0, 0;
            /// `top = load32_le(top)`
            Load4 = 29, "load4", 0, 0;
            /// `*a = low8(b)`
            Store1 = 30, "store1", 0, -8;
            /// `*a = low16(b)`
            Store2 = 31, "store2", 0, -8;
            /// `*a = b`
            Store4 = 32, "store4", 0, -8;
            /// Store the top of the stack into the outgoing argument slot at
            /// frame offset `operand`.
            Arg = 33, "arg", 1, -4;
            /// Copy `operand` bytes from `b` to `a`.
            BlockCopy = 34, "block_copy", 4, -8;

            /// `top = sign_extend(low8(top))`
            Sex8 = 35, "sex8", 0, 0;
            /// `top = sign_extend(low16(top))`
            Sex16 = 36, "sex16", 0, 0;

            /// `top = -top`
            Negi = 37, "negi", 0, 0;
            /// `a + b`
            Add = 38, "add", 0, -4;
            /// `a - b`
            Sub = 39, "sub", 0, -4;
            /// Signed `a / b`.
            Divi = 40, "divi", 0, -4;
            /// Unsigned `a / b`.
            Divu = 41, "divu", 0, -4;
            /// Signed `a % b`.
            Modi = 42, "modi", 0, -4;
            /// Unsigned `a % b`.
            Modu = 43, "modu", 0, -4;
            /// Signed `a * b`.
            Muli = 44, "muli", 0, -4;
            /// Unsigned `a * b`.
            Mulu = 45, "mulu", 0, -4;
            /// `a & b`
            Band = 46, "band", 0, -4;
            /// `a | b`
            Bor = 47, "bor", 0, -4;
            /// `a ^ b`
            Bxor = 48, "bxor", 0, -4;
            /// `top = !top`
            Bcom = 49, "bcom", 0, 0;
            /// `a << b`
            Lsh = 50, "lsh", 0, -4;
            /// Arithmetic `a >> b`.
            Rshi = 51, "rshi", 0, -4;
            /// Logical `a >> b`.
            Rshu = 52, "rshu", 0, -4;

            /// Float `top = -top`.
            Negf = 53, "negf", 0, 0;
            /// Float `a + b`.
            Addf = 54, "addf", 0, -4;
            /// Float `a - b`.
            Subf = 55, "subf", 0, -4;
            /// Float `a / b`.
            Divf = 56, "divf", 0, -4;
            /// Float `a * b`.
            Mulf = 57, "mulf", 0, -4;
            /// `top = top as f32`
            Cvif = 58, "cvif", 0, 0;
            /// `top = top as i32` (truncating, saturating)
            Cvfi = 59, "cvfi", 0, 0;
        }
    };
}

macro_rules! define_opcode {
    (
        $(
            $( #[$attr:meta] )*
            $name:ident = $encoding:literal, $mnemonic:literal, $width:literal, $delta:literal;
        )*
    ) => {
        /// An opcode without its operand.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $( #[$attr] )*
                $name = $encoding,
            )*
        }

        impl Opcode {
            /// The number of defined opcodes; every encoding below this is valid.
            pub const COUNT: u8 = 0 $( + { let _ = $encoding; 1 } )*;

            /// Decode an opcode byte, returning `None` for unknown encodings.
            pub fn new(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $encoding => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// The assembler mnemonic of this opcode.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Size in bytes of the immediate that follows this opcode.
            pub fn operand_width(self) -> usize {
                match self {
                    $( Opcode::$name => $width, )*
                }
            }

            /// Change of the operand-stack depth, in bytes, caused by this
            /// opcode.
            pub fn stack_delta(self) -> i32 {
                match self {
                    $( Opcode::$name => $delta, )*
                }
            }
        }
    };
}
for_each_opcode!(define_opcode);

impl Opcode {
    /// Is this one of the compare-and-branch opcodes?
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::Eq
                | Opcode::Ne
                | Opcode::Lti
                | Opcode::Lei
                | Opcode::Gti
                | Opcode::Gei
                | Opcode::Ltu
                | Opcode::Leu
                | Opcode::Gtu
                | Opcode::Geu
                | Opcode::Eqf
                | Opcode::Nef
                | Opcode::Ltf
                | Opcode::Lef
                | Opcode::Gtf
                | Opcode::Gef
        )
    }

    /// The access width of a load opcode, if this is one.
    pub fn load_width(self) -> Option<u32> {
        match self {
            Opcode::Load1 => Some(1),
            Opcode::Load2 => Some(2),
            Opcode::Load4 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
