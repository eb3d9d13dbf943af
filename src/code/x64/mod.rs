//! x86-64 stubs

/// `int f() { return 1 ? 1 : 0; }` as emitted without optimizations.
///
/// ```text
/// 55                push rbp
/// 48 89 e5          mov rbp, rsp
/// b8 01 00 00 00    mov eax, 1
/// 5d                pop rbp
/// c3                ret
/// ```
pub const RETURN_ONE: [u8; 11] = [
    0x55, 0x48, 0x89, 0xe5, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x5d, 0xc3,
];

/// Offset of the low byte of the `mov eax, 1` immediate in [`RETURN_ONE`].
///
/// The constant condition was folded into this immediate, so zeroing it sends the stub down the false branch.
pub const BRANCH_IMMEDIATE: usize = 5;
