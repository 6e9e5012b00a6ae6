use crate::{instantiate, return_42, strategies};
use qvm::{
    Disassembler, HeaderError, ImageBuilder, LoadError, Module, Opcode::*, Syscalls,
    VerifyErrorKind, Version,
};

fn verify_error(b: &ImageBuilder) -> VerifyErrorKind {
    match Module::from_bytes("test", &b.build()) {
        Err(LoadError::Verify(e)) => e.kind,
        other => panic!("expected a verification error, got {other:?}"),
    }
}

#[test]
fn return_42_on_every_backend() -> anyhow::Result<()> {
    for strategy in strategies() {
        let mut vm = instantiate(&return_42(), strategy, Syscalls::new(), ())?;
        assert_eq!(vm.call(&[])?, 42);
        // Calls leave the instance as they found it.
        assert_eq!(vm.call(&[1, 2, 3])?, 42);
        assert_eq!(vm.call_level(), 0);
        assert_eq!(vm.program_stack(), vm.memory().size() as i32);
    }
    Ok(())
}

#[test]
fn header_regions_must_line_up() {
    let mut image = return_42().build();
    // Move the data region one word past the end of the code.
    let data_offset = u32::from_le_bytes(image[16..20].try_into().unwrap()) + 4;
    image[16..20].copy_from_slice(&data_offset.to_le_bytes());
    match Module::from_bytes("test", &image) {
        Err(LoadError::Header(HeaderError::BadDataOffset)) => {}
        other => panic!("unexpected {other:?}"),
    }

    let mut image = return_42().build();
    image.push(0);
    assert!(matches!(
        Module::from_bytes("test", &image),
        Err(LoadError::Header(HeaderError::BadLitLength))
    ));

    assert!(matches!(
        Module::from_bytes("test", &[0; 8]),
        Err(LoadError::Header(HeaderError::Truncated))
    ));
    let mut image = return_42().build();
    image[0] ^= 0xff;
    assert!(matches!(
        Module::from_bytes("test", &image),
        Err(LoadError::Header(HeaderError::BadMagic(_)))
    ));
}

#[test]
fn bad_opcodes_are_rejected() {
    let mut image = return_42().build();
    // The first code byte is the `enter` opcode.
    image[32] = 0xee;
    assert!(matches!(
        Module::from_bytes("test", &image),
        Err(LoadError::Decode(_))
    ));
}

#[test]
fn structural_rules() {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Enter, 8), (Push, 0), (Leave, 8)]);
    assert_eq!(verify_error(&b), VerifyErrorKind::MissingProcEnd);

    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, 2), (Jump, 0), (Push, 0), (Leave, 8)]);
    assert_eq!(verify_error(&b), VerifyErrorKind::SelfLoop);

    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Push, 0), (Leave, 8), (Push, 0)]);
    assert_eq!(verify_error(&b), VerifyErrorKind::MissingFinalReturn);

    // Word loads from constant addresses must stay within static data.
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, 4), (Load4, 0), (Leave, 8), (Push, 0), (Leave, 8)])
        .data_words(&[1]);
    assert_eq!(verify_error(&b), VerifyErrorKind::BadLoadAddress);
    b.data_words(&[2]);
    Module::from_bytes("test", &b.build()).unwrap();
}

#[test]
fn verified_depths() {
    // if (arg0 == 3) return 1; return 0;
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Local, 16),
        (Load4, 0),
        (Const, 3),
        (Eq, 7),
        (Const, 0),
        (Leave, 8),
        (Const, 1),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    let module = Module::from_bytes("test", &b.build()).unwrap();
    let code = module.instructions();
    for (i, inst) in code.iter().enumerate() {
        if inst.op.is_conditional_jump() {
            assert_eq!(inst.depth, 8, "conditional jump at {i}");
            assert_eq!(code[inst.operand as usize].depth, 0);
            assert!(code[inst.operand as usize].jump_used);
        }
    }
    assert_eq!(module.procedures().len(), 1);
    assert_eq!(module.procedures()[0].range(), 0..=10);

    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ()).unwrap();
        assert_eq!(vm.call(&[3]).unwrap(), 1);
        assert_eq!(vm.call(&[4]).unwrap(), 0);
    }
}

#[test]
fn version_2_jump_tables() {
    // switch (arg0) through a computed jump: cases at 4 and 6.
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Local, 16),
        (Load4, 0),
        (Jump, 0),
        (Const, 10),
        (Leave, 8),
        (Const, 20),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ])
    .jump_targets(&[4, 6]);
    let module = Module::from_bytes("switch", &b.build()).unwrap();
    assert_eq!(module.header().version, Version::V2);
    assert_eq!(module.jump_table(), Some(&[4, 6][..]));
    assert!(module.procedures()[0].computed_jump);
    // Only listed targets are marked, even at depth 0.
    assert_eq!(module.instructions()[8].depth, 0);
    assert!(!module.instructions()[8].jump_used);

    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ()).unwrap();
        assert_eq!(vm.call(&[4]).unwrap(), 10);
        assert_eq!(vm.call(&[6]).unwrap(), 20);
        for target in [8, 5, 0, -1] {
            let err = vm.call(&[target]).unwrap_err();
            assert_eq!(err.downcast_ref::<qvm::Trap>(), Some(&qvm::Trap::BadJumpTarget));
        }
    }

    let text = Disassembler::new(&module).disassemble();
    assert!(text.contains("; 2 jump table targets"));
    assert!(text.contains("proc_0: ; frame 8, computed jumps"));
}

#[test]
fn jump_tables_need_code() {
    let mut b = ImageBuilder::new();
    b.jump_targets(&[5]);
    let err = match Module::from_bytes("empty", &b.build()) {
        Err(LoadError::Verify(e)) => e,
        other => panic!("expected a verification error, got {other:?}"),
    };
    assert_eq!((err.index, err.kind), (0, VerifyErrorKind::JumpOutOfRange));
}
