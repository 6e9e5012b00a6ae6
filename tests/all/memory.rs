use crate::{instantiate, strategies};
use anyhow::Result;
use qvm::{ImageBuilder, Memory, Module, Opcode::*, PROGRAM_STACK_SIZE, SandboxAddr, Syscalls};

#[test]
fn layout() -> Result<()> {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, 4), (Load4, 0), (Leave, 8), (Push, 0), (Leave, 8)])
        .data_words(&[7, 9])
        .lit(b"hi\0")
        .bss(0x1_0000);
    let module = Module::from_bytes("layout", &b.build())?;
    assert_eq!(module.static_data_length(), 8 + 3 + 0x1_0000);

    let memory = Memory::new(&module);
    // Static data plus the program stack, rounded up.
    assert_eq!(memory.size(), 0x4_0000);
    assert_eq!(memory.mask(), 0x3_ffff);
    assert_eq!(&memory.data()[..11], b"\x07\0\0\0\x09\0\0\0hi\0");
    assert!(memory.data()[11..].iter().all(|&b| b == 0));

    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ())?;
        assert_eq!(vm.call(&[])?, 9);
        assert_eq!(vm.program_stack(), 0x4_0000);
        assert!(vm.program_stack() - PROGRAM_STACK_SIZE >= module.static_data_length() as i32);
    }
    Ok(())
}

#[test]
fn every_address_lands_in_the_arena() {
    let size = 0x2_0000u32;
    for addr in [0, 1, 3, 0x1_ffff, 0x2_0000, -1, -4, i32::MIN, i32::MAX, 0x7fff_fffd] {
        for width in [1, 2, 4] {
            let a = SandboxAddr::new(addr, size - 1, width);
            assert!(a.get() + width as usize <= size as usize, "{addr:#x}/{width}");
            assert_eq!(a.get() % width as usize, 0);
        }
    }
}

#[test]
fn module_addresses_are_masked() -> Result<()> {
    // *(int *)0x7fff0010 = 1234; return *(int *)(0x10 + 0);
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Const, 0x7fff_0010),
        (Const, 1234),
        (Store4, 0),
        (Const, 0x10),
        (Const, 0),
        (Add, 0),
        (Load4, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ())?;
        assert_eq!(vm.call(&[])?, 1234);
        assert_eq!(&vm.memory().data()[0x10..0x14], &1234i32.to_le_bytes());
    }
    Ok(())
}

#[test]
fn block_copy() -> Result<()> {
    // memcpy(0x20, "hello", 6); return *(int *)0x20;
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Const, 0x20),
        (Const, 8),
        (BlockCopy, 6),
        (Const, 0x20),
        (Load4, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ])
    .data_words(&[1, 2])
    .lit(b"hello\0")
    .bss(0x40);
    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ())?;
        assert_eq!(vm.call(&[])?, i32::from_le_bytes(*b"hell"));
        assert_eq!(&vm.memory().data()[0x20..0x26], b"hello\0");
    }
    Ok(())
}

#[test]
fn byte_and_half_word_access() -> Result<()> {
    // short s = -2 at 0x30; return (signed char)*(char *)0x31 + *(unsigned short *)0x30;
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Const, 0x30),
        (Const, -2),
        (Store2, 0),
        (Const, 0x31),
        (Load1, 0),
        (Sex8, 0),
        (Const, 0x30),
        (Load2, 0),
        (Add, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ])
    .bss(0x40);
    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ())?;
        assert_eq!(vm.call(&[])?, -1 + 0xfffe);
    }
    Ok(())
}
