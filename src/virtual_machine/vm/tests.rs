use super::*;
use crate::utils::test_utils::utils::aligned_buffer;
use crate::virtual_machine::arena::HEADER_SIZE;
use crate::virtual_machine::assembler::{Assembled, assemble_program};
use crate::virtual_machine::image::ModuleName;

const ARENA: usize = 8 * 1024;
const STACK_CELLS: u16 = 64;

/// Values handed to the test host by syscalls 1 (i32), 2 (i64) and 3 (f64).
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    I32(i32),
    I64(i64),
    F64(f64),
}

fn service(vm: &mut Vm, call: Suspended, out: &mut Vec<Value>) {
    let value = match call.syscall {
        1 => Value::I32(vm.pop_i32().unwrap()),
        2 => Value::I64(vm.pop_i64().unwrap()),
        3 => Value::F64(vm.pop_f64().unwrap()),
        other => panic!("unexpected syscall {other}"),
    };
    out.push(value);
}

fn flags_for(name: &ModuleName, trusted: &[&str]) -> ImportFlags {
    if trusted.iter().any(|t| t.as_bytes() == name.trimmed()) {
        ImportFlags::SKIP_VERIFICATION | ImportFlags::TRUSTED_MODULE
    } else {
        ImportFlags::SKIP_VERIFICATION
    }
}

/// Imports the startup module and every module it pulls in.
fn import_all<'a>(
    vm: &mut Vm<'a>,
    modules: &'a [Assembled],
    trusted: &[&str],
) -> Result<(), VmError> {
    let startup = &modules[0];
    vm.module_import(&startup.name, &startup.image, 0, flags_for(&startup.name, trusted))?;
    while let Some(name) = vm.module_missing() {
        let module = modules
            .iter()
            .find(|m| m.name == name)
            .expect("module was not assembled");
        vm.module_import(&name, &module.image, 0, flags_for(&name, trusted))?;
    }
    Ok(())
}

fn drive(vm: &mut Vm) -> Result<Vec<Value>, VmError> {
    let mut out = Vec::new();
    loop {
        match vm.execute()? {
            Outcome::Completed => return Ok(out),
            Outcome::Syscall(call) => service(vm, call, &mut out),
        }
    }
}

fn run_program(sources: &[&str], trusted: &[&str]) -> Result<Vec<Value>, VmError> {
    let modules = assemble_program(sources).expect("assembly failed");
    let mut buf = aligned_buffer(ARENA);
    let mut vm = Vm::initialize(&mut buf, 0, 0)?;
    import_all(&mut vm, &modules, trusted)?;
    drive(&mut vm)
}

/// Wraps `body` in a security-safe-critical `main` of a trusted startup module.
fn app(body: &str) -> String {
    format!(
        ".module app\n.executable\n.stack {STACK_CELLS}\n.main main\n\
         .func main stack=16 safe\n{body}\n    RET\n"
    )
}

fn run(body: &str) -> Result<Vec<Value>, VmError> {
    run_program(&[app(body).as_str()], &["app"])
}

fn run_ok(body: &str) -> Vec<Value> {
    run(body).expect("vm run failed")
}

fn run_err(body: &str) -> VmError {
    run(body).expect_err("expected a fault")
}

// ==================== Basics ====================

#[test]
fn arena_must_be_aligned_and_hold_the_header() {
    let mut buf = aligned_buffer(HEADER_SIZE as usize + 4);
    assert!(matches!(
        Vm::initialize(&mut buf[1..], 0, 0),
        Err(VmError::ArgumentInvalid { .. })
    ));

    let mut short = aligned_buffer(HEADER_SIZE as usize - 4);
    assert!(matches!(
        Vm::initialize(&mut short, 0, 0),
        Err(VmError::ArgumentInvalid { .. })
    ));

    let mut exact = aligned_buffer(HEADER_SIZE as usize);
    let vm = Vm::initialize(&mut exact, 7, 0).unwrap();
    assert_eq!(vm.heap_available(), 0);
    assert_eq!(vm.context(), 7);
}

#[test]
fn forged_return_frame_faults() {
    // Overwrites the saved halt frame so that it names module 255.
    let err = run_err(
        "LDC_I32_0\nLDLOCA 0\nLDC_X32 252\nSUB_I32\nLDC_X32 0xFF00\n\
         STFLD_X32 0\nPOP_X32",
    );
    assert!(matches!(err, VmError::InvalidProgram { module: 255, .. }));
}

#[test]
fn straight_line_program_completes() {
    assert_eq!(run_ok("LDC_I32_1\nLDC_I32_2\nADD_I32\nPOP_X32"), vec![]);
}

#[test]
fn executable_without_main_completes() {
    let modules = assemble_program(&[".module app\n.executable"]).unwrap();
    let mut buf = aligned_buffer(ARENA);
    let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
    import_all(&mut vm, &modules, &[]).unwrap();
    assert_eq!(vm.execute(), Ok(Outcome::Completed));
}

#[test]
fn execute_requires_every_module() {
    let modules = assemble_program(&[
        ".module app\n.executable\n.import lib",
        ".module lib",
    ])
    .unwrap();
    let mut buf = aligned_buffer(ARENA);
    let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
    assert!(matches!(vm.execute(), Err(VmError::InvalidOperation { .. })));

    vm.module_import(&modules[0].name, &modules[0].image, 0, ImportFlags::SKIP_VERIFICATION)
        .unwrap();
    assert_eq!(vm.module_missing(), Some(modules[1].name));
    assert!(matches!(vm.execute(), Err(VmError::InvalidOperation { .. })));
}

#[test]
fn constants_reach_the_host() {
    assert_eq!(
        run_ok("LDC_I32_M1\nSYSCALL 1 1\nLDC_I32_S -100\nSYSCALL 1 1\nLDC_X32 0x12345678\nSYSCALL 1 1"),
        vec![Value::I32(-1), Value::I32(-100), Value::I32(0x1234_5678)]
    );
    assert_eq!(
        run_ok("LDC_X64 -5000000000\nSYSCALL 2 2\nLDC_X64 0.5\nSYSCALL 2 3"),
        vec![Value::I64(-5_000_000_000), Value::F64(0.5)]
    );
}

#[test]
fn leftover_operands_fail_at_halt() {
    assert_eq!(
        run_err("LDC_I32_1"),
        VmError::StackImbalance {
            expected: STACK_CELLS,
            actual: STACK_CELLS - 1,
        }
    );
}

#[test]
fn undefined_opcode_is_an_invalid_program() {
    let mut modules = assemble_program(&[app("NOP").as_str()]).unwrap();
    let main = modules[0].functions["main"] as usize;
    modules[0].image[main + 4] = 0xFF;

    let mut buf = aligned_buffer(ARENA);
    let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
    import_all(&mut vm, &modules, &["app"]).unwrap();
    assert!(matches!(
        vm.execute(),
        Err(VmError::InvalidProgram { module: 0, .. })
    ));
}

// ==================== Stack manipulation ====================

#[test]
fn swap_over_and_rot() {
    let print3 = "SYSCALL 1 1\nSYSCALL 1 1\nSYSCALL 1 1";
    assert_eq!(
        run_ok(&format!("LDC_I32_1\nLDC_I32_2\nSWAP\nLDC_I32_3\n{print3}")),
        vec![Value::I32(3), Value::I32(1), Value::I32(2)]
    );
    assert_eq!(
        run_ok(&format!("LDC_I32_1\nLDC_I32_2\nOVER\n{print3}")),
        vec![Value::I32(1), Value::I32(2), Value::I32(1)]
    );
    assert_eq!(
        run_ok(&format!("LDC_I32_1\nLDC_I32_2\nLDC_I32_3\nROT\n{print3}")),
        vec![Value::I32(2), Value::I32(1), Value::I32(3)]
    );
}

#[test]
fn nip_tuck_and_wide_duplicates() {
    assert_eq!(
        run_ok("LDC_I32_1\nLDC_I32_2\nNIP\nSYSCALL 1 1"),
        vec![Value::I32(2)]
    );
    assert_eq!(
        run_ok("LDC_I32_1\nLDC_I32_2\nTUCK\nSYSCALL 1 1\nSYSCALL 1 1\nSYSCALL 1 1"),
        vec![Value::I32(2), Value::I32(1), Value::I32(2)]
    );
    assert_eq!(
        run_ok("LDC_X64 7\nDUP_X64\nADD_I64\nSYSCALL 2 2\nLDC_X64 1\nPOP_X64"),
        vec![Value::I64(14)]
    );
}

#[test]
fn popping_an_empty_stack_faults() {
    assert!(matches!(run_err("POP_X32"), VmError::StackImbalance { .. }));
}

// ==================== Integer arithmetic ====================

#[test]
fn i32_arithmetic_and_bitwise() {
    assert_eq!(
        run_ok(
            "LDC_I32_S 7\nLDC_I32_3\nSUB_I32\nSYSCALL 1 1\n\
             LDC_I32_S -7\nLDC_I32_2\nDIV_I32\nSYSCALL 1 1\n\
             LDC_I32_S -7\nLDC_I32_2\nREM_I32\nSYSCALL 1 1\n\
             LDC_I32_S 12\nLDC_I32_S 10\nAND_I32\nSYSCALL 1 1\n\
             LDC_I32_1\nLDC_I32_4\nSHL_I32\nSYSCALL 1 1\n\
             LDC_I32_M1\nLDC_I32_S 28\nSHR_I32_UN\nSYSCALL 1 1\n\
             LDC_I32_0\nNOT_I32\nSYSCALL 1 1"
        ),
        vec![
            Value::I32(4),
            Value::I32(-3),
            Value::I32(-1),
            Value::I32(8),
            Value::I32(16),
            Value::I32(15),
            Value::I32(-1),
        ]
    );
}

#[test]
fn i32_comparisons_signed_and_unsigned() {
    assert_eq!(
        run_ok(
            "LDC_I32_M1\nLDC_I32_1\nCLT_I32\nSYSCALL 1 1\n\
             LDC_I32_M1\nLDC_I32_1\nCLT_I32_UN\nSYSCALL 1 1\n\
             LDC_I32_5\nLDC_I32_5\nCGE_I32\nSYSCALL 1 1\n\
             LDC_I32_5\nLDC_I32_4\nCEQ_I32\nSYSCALL 1 1"
        ),
        vec![Value::I32(1), Value::I32(0), Value::I32(1), Value::I32(0)]
    );
}

#[test]
fn i32_overflow_faults() {
    assert_eq!(run_err("LDC_X32 0x7fffffff\nLDC_I32_1\nADD_I32"), VmError::Overflow);
    assert_eq!(run_err("LDC_X32 0x80000000\nNEG_I32"), VmError::Overflow);
    assert_eq!(run_err("LDC_X32 0x80000000\nLDC_I32_M1\nDIV_I32"), VmError::Overflow);
}

#[test]
fn minimum_remainder_by_minus_one_is_zero() {
    assert_eq!(
        run_ok("LDC_X32 0x80000000\nLDC_I32_M1\nREM_I32\nSYSCALL 1 1"),
        vec![Value::I32(0)]
    );
}

#[test]
fn division_by_zero_faults() {
    assert_eq!(run_err("LDC_I32_1\nLDC_I32_0\nDIV_I32"), VmError::DivideByZero);
    assert_eq!(run_err("LDC_I32_1\nLDC_I32_0\nREM_I32_UN"), VmError::DivideByZero);
    assert_eq!(run_err("LDC_X64 1\nLDC_X64 0\nDIV_I64"), VmError::DivideByZero);
}

#[test]
fn narrowing_conversions() {
    assert_eq!(
        run_ok(
            "LDC_X32 0x1ff\nCONV_I8_I32\nSYSCALL 1 1\n\
             LDC_X32 0x1ff\nCONV_U8_I32\nSYSCALL 1 1\n\
             LDC_X32 0x18000\nCONV_I16_I32\nSYSCALL 1 1"
        ),
        vec![Value::I32(-1), Value::I32(255), Value::I32(-32768)]
    );
}

#[test]
fn i64_arithmetic_shifts_and_comparisons() {
    assert_eq!(
        run_ok(
            "LDC_X64 0x100000000\nLDC_X64 3\nMUL_I64\nSYSCALL 2 2\n\
             LDC_X64 1\nLDC_I32_S 40\nSHL_I64\nSYSCALL 2 2\n\
             LDC_X64 -16\nLDC_I32_2\nSHR_I64\nSYSCALL 2 2\n\
             LDC_X64 -1\nLDC_X64 1\nCLT_I64\nSYSCALL 1 1\n\
             LDC_X64 -1\nLDC_X64 1\nCLT_I64_UN\nSYSCALL 1 1"
        ),
        vec![
            Value::I64(0x3_0000_0000),
            Value::I64(1 << 40),
            Value::I64(-4),
            Value::I32(1),
            Value::I32(0),
        ]
    );
}

#[test]
fn i64_overflow_faults() {
    assert_eq!(
        run_err("LDC_X64 0x7fffffffffffffff\nLDC_X64 1\nADD_I64"),
        VmError::Overflow
    );
}

#[test]
fn widening_and_narrowing_between_widths() {
    assert_eq!(
        run_ok(
            "LDC_I32_M1\nCONV_I64_I32\nSYSCALL 2 2\n\
             LDC_I32_M1\nCONV_U64_I32\nSYSCALL 2 2\n\
             LDC_X64 0x123456789\nCONV_I32_I64\nSYSCALL 1 1"
        ),
        vec![
            Value::I64(-1),
            Value::I64(0xFFFF_FFFF),
            Value::I32(0x2345_6789),
        ]
    );
}

// ==================== Floating point ====================

#[test]
fn f64_arithmetic() {
    assert_eq!(
        run_ok(
            "LDC_X64 1.5\nLDC_X64 2.25\nADD_F64\nSYSCALL 2 3\n\
             LDC_X64 1.0\nLDC_X64 4.0\nDIV_F64\nSYSCALL 2 3\n\
             LDC_X64 2.5\nNEG_F64\nSYSCALL 2 3"
        ),
        vec![Value::F64(3.75), Value::F64(0.25), Value::F64(-2.5)]
    );
}

#[test]
fn float_division_by_zero_does_not_fault() {
    assert_eq!(
        run_ok("LDC_X64 1.0\nLDC_X64 0.0\nDIV_F64\nSYSCALL 2 3"),
        vec![Value::F64(f64::INFINITY)]
    );
}

#[test]
fn nan_compares_unordered() {
    let nan = "LDC_X64 0.0\nLDC_X64 0.0\nDIV_F64\nDUP_X64";
    assert_eq!(
        run_ok(&format!("{nan}\nCEQ_F64\nSYSCALL 1 1\n{nan}\nCEQ_F64_UN\nSYSCALL 1 1")),
        vec![Value::I32(0), Value::I32(1)]
    );
}

#[test]
fn float_conversions() {
    assert_eq!(
        run_ok(
            "LDC_X64 -2.75\nCONV_I32_F64\nSYSCALL 1 1\n\
             LDC_X32 1.5\nLDC_X32 2.0\nMUL_F32\nCONV_F64_F32\nSYSCALL 2 3\n\
             LDC_I32_S -3\nCONV_F64_I32\nSYSCALL 2 3\n\
             LDC_X64 3.9\nCONV_I64_F64\nSYSCALL 2 2"
        ),
        vec![
            Value::I32(-2),
            Value::F64(3.0),
            Value::F64(-3.0),
            Value::I64(3),
        ]
    );
}

// ==================== Objects and arrays ====================

#[test]
fn object_fields_round_trip_with_extension() {
    assert_eq!(
        run_ok(
            "NEWOBJ 16\n\
             DUP_X32\nLDC_I32_S -5\nSTFLD_X16 2\n\
             DUP_X32\nLDC_X64 0x1122334455667788\nSTFLD_X64 8\n\
             DUP_X32\nLDFLD_I16 2\nSYSCALL 1 1\n\
             DUP_X32\nLDFLD_U16 2\nSYSCALL 1 1\n\
             LDFLD_X64 8\nSYSCALL 2 2"
        ),
        vec![
            Value::I32(-5),
            Value::I32(0xFFFB),
            Value::I64(0x1122_3344_5566_7788),
        ]
    );
}

#[test]
fn new_objects_are_zeroed() {
    assert_eq!(
        run_ok("NEWOBJ 8\nLDFLD_X32 4\nSYSCALL 1 1"),
        vec![Value::I32(0)]
    );
}

#[test]
fn array_elements_store_and_load() {
    assert_eq!(
        run_ok(
            "LDC_I32_4\nNEWARR 4\n\
             DUP_X64\nLDC_I32_2\nLDC_I32_S 77\nSTELEM_X32\n\
             DUP_X64\nLDC_I32_0\nLDC_I32_M1\nSTELEM_X32\n\
             DUP_X64\nLDC_I32_0\nLDELEM_X32\nSYSCALL 1 1\n\
             LDC_I32_2\nLDELEM_X32\nSYSCALL 1 1"
        ),
        vec![Value::I32(-1), Value::I32(77)]
    );
}

#[test]
fn byte_arrays_sign_and_zero_extend() {
    assert_eq!(
        run_ok(
            "LDC_I32_2\nNEWARR 1\n\
             DUP_X64\nLDC_I32_1\nLDC_I32_S -2\nSTELEM_X8\n\
             DUP_X64\nLDC_I32_1\nLDELEM_I8\nSYSCALL 1 1\n\
             LDC_I32_1\nLDELEM_U8\nSYSCALL 1 1"
        ),
        vec![Value::I32(-2), Value::I32(254)]
    );
}

#[test]
fn negative_array_length_is_rejected() {
    assert!(matches!(
        run_err("LDC_I32_M1\nNEWARR 4"),
        VmError::ArgumentInvalid { .. }
    ));
}

#[test]
fn array_index_is_bounds_checked() {
    assert_eq!(
        run_err("LDC_I32_2\nNEWARR 4\nLDC_I32_2\nLDELEM_X32"),
        VmError::IndexOutOfRange {
            index: 2,
            length: 2,
        }
    );
    assert_eq!(
        run_err("LDC_I32_2\nNEWARR 4\nLDC_I32_M1\nLDC_I32_0\nSTELEM_X32"),
        VmError::IndexOutOfRange {
            index: -1,
            length: 2,
        }
    );
}

#[test]
fn forged_array_length_cannot_overflow_the_address() {
    let err = run_err("LDC_X32 0x7FFFFFFF\nNEWOBJ 4\nLDC_X32 0x20000\nLDELEMA 65535");
    assert!(matches!(err, VmError::InvalidProgram { .. }));
}

#[test]
fn null_check_precedes_bounds_check() {
    // length 0, null reference, index 5
    assert_eq!(
        run_err("LDC_I32_0\nLDC_I32_0\nLDC_I32_5\nLDELEM_X32"),
        VmError::NullReference
    );
    assert_eq!(run_err("LDC_I32_0\nLDFLD_X32 0"), VmError::NullReference);
    assert_eq!(
        run_err("LDC_I32_0\nLDC_I32_1\nSTFLD_X32 0"),
        VmError::NullReference
    );
}

#[test]
fn slices_view_part_of_an_array() {
    assert_eq!(
        run_ok(
            "LDC_I32_4\nNEWARR 1\n\
             DUP_X64\nLDC_I32_1\nLDC_I32_S 20\nSTELEM_X8\n\
             DUP_X64\nLDC_I32_3\nLDC_I32_S 40\nSTELEM_X8\n\
             LDC_I32_1\nSLICE1\n\
             DUP_X64\nLDC_I32_0\nLDELEM_U8\nSYSCALL 1 1\n\
             DUP_X64\nLDC_I32_2\nLDELEM_U8\nSYSCALL 1 1\n\
             POP_X32\nSYSCALL 1 1"
        ),
        vec![Value::I32(20), Value::I32(40), Value::I32(3)]
    );
}

#[test]
fn slice_ranges_are_checked() {
    assert!(matches!(
        run_err("LDC_I32_4\nNEWARR 1\nLDC_I32_5\nSLICE1"),
        VmError::ArgumentInvalid { .. }
    ));
    assert_eq!(
        run_err("LDC_I32_4\nNEWARR 1\nLDC_I32_1\nLDC_I32_2\nSLICE2\nLDC_I32_2\nLDELEM_U8"),
        VmError::IndexOutOfRange {
            index: 2,
            length: 2,
        }
    );
}

#[test]
fn heap_exhaustion_is_reported() {
    assert!(matches!(
        run_err("NEWOBJ 60000"),
        VmError::OutOfMemory { .. }
    ));
}

// ==================== Calls ====================

const CALLS: &str = "
.module app
.executable
.stack 64
.main main

.func main stack=8 safe
    LDC_I32_S 6
    LDC_I32_S 7
    CALL mul
    SYSCALL 1 1
    LDC_X64 21
    CALL twice
    SYSCALL 2 2
    LDC_I32_5
    CALL fact
    SYSCALL 1 1
    LDC_I32_S 9
    LDFTN double
    CALLI
    SYSCALL 1 1
    RET

.func mul args=2
    LDLOC_X32 0
    LDLOC_X32 2
    MUL_I32
    RET_X32

.func twice args=2
    LDLOC_X64 0
    LDLOC_X64 2
    ADD_I64
    RET_X64

.func fact args=1 stack=6
    LDLOC_X32 0
    LDC_I32_2
    CLT_I32
    BRFALSE_S recurse
    LDC_I32_1
    RET_X32
recurse:
    LDLOC_X32 0
    LDC_I32_1
    SUB_I32
    CALL fact
    LDLOC_X32 1
    MUL_I32
    RET_X32

.func double args=1
    LDLOC_X32 0
    LDLOC_X32 1
    ADD_I32
    RET_X32
";

#[test]
fn calls_pass_arguments_and_return_values() {
    assert_eq!(
        run_program(&[CALLS], &["app"]).unwrap(),
        vec![
            Value::I32(42),
            Value::I64(42),
            Value::I32(120),
            Value::I32(18),
        ]
    );
}

#[test]
fn locals_drive_a_loop() {
    let source = "
        .module app
        .executable
        .main main
        .func main safe
            LDC_I32_S 10
            CALL fib
            SYSCALL 1 1
            RET
        .func fib args=1 locals=2 stack=4
            LDC_I32_0
            STLOC_X32 1
            LDC_I32_1
            STLOC_X32 2
        loop:
            LDLOC_X32 2
            BRFALSE_S done
            LDLOC_X32 0
            LDLOC_X32 2
            ADD_I32
            LDLOC_X32 2
            STLOC_X32 2
            STLOC_X32 2
            LDLOC_X32 2
            LDC_I32_1
            SUB_I32
            STLOC_X32 3
            BR_S loop
        done:
            LDLOC_X32 0
            RET_X32
    ";
    assert_eq!(run_program(&[source], &["app"]).unwrap(), vec![Value::I32(55)]);
}

#[test]
fn tail_calls_do_not_grow_the_return_stack() {
    let source = "
        .module app
        .executable
        .stack 32
        .main main
        .func main
            LDC_X32 1000
            CALL spin
            POP_X32
            RET
        .func spin
            DUP_X32
            BRFALSE_S done
            LDC_I32_1
            SUB_I32
            CALL spin
            RET
        done:
            RET
    ";
    assert_eq!(run_program(&[source], &[]), Ok(vec![]));
}

#[test]
fn unbounded_recursion_overflows() {
    let source = "
        .module app
        .executable
        .stack 32
        .main main
        .func main
            CALL down
            RET
        .func down
            CALL down
            NOP
            RET
    ";
    assert!(matches!(
        run_program(&[source], &[]),
        Err(VmError::StackOverflow { .. })
    ));
}

#[test]
fn calls_cross_module_boundaries() {
    let app = "
        .module app
        .executable
        .import math
        .main main
        .func main safe
            LDC_I32_S 20
            CALL math.half
            SYSCALL 1 1
            RET
    ";
    let math = "
        .module math
        .func half args=1
            LDLOC_X32 0
            LDC_I32_2
            DIV_I32
            RET_X32
    ";
    assert_eq!(
        run_program(&[app, math], &["app"]).unwrap(),
        vec![Value::I32(10)]
    );
}

// ==================== Syscalls ====================

fn with_vm(source: &str, trusted: &[&str], check: impl FnOnce(&mut Vm)) {
    let modules = assemble_program(&[source]).expect("assembly failed");
    let mut buf = aligned_buffer(ARENA);
    let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
    import_all(&mut vm, &modules, trusted).unwrap();
    check(&mut vm);
}

#[test]
fn syscall_reports_the_expected_cursor() {
    with_vm(&app("LDC_I32_S 5\nSYSCALL 1 7"), &["app"], |vm| {
        assert_eq!(
            vm.execute(),
            Ok(Outcome::Syscall(Suspended {
                syscall: 7,
                sp_expected: STACK_CELLS,
            }))
        );
        assert_eq!(vm.syscall(), 7);
        assert_eq!(vm.stack_pointer(), STACK_CELLS - 1);
        assert_eq!(vm.pop_i32(), Ok(5));
        assert_eq!(vm.execute(), Ok(Outcome::Completed));
        assert_eq!(vm.syscall(), 0);
    });
}

#[test]
fn resume_requires_the_expected_cursor() {
    with_vm(&app("LDC_I32_S 5\nSYSCALL 1 1"), &["app"], |vm| {
        assert!(matches!(vm.execute(), Ok(Outcome::Syscall(_))));
        assert_eq!(
            vm.execute(),
            Err(VmError::StackImbalance {
                expected: STACK_CELLS,
                actual: STACK_CELLS - 1,
            })
        );
        // the failed resume leaves the syscall pending
        assert_eq!(vm.syscall(), 1);
        vm.pop_i32().unwrap();
        assert_eq!(vm.execute(), Ok(Outcome::Completed));
    });
}

#[test]
fn syscall_results_flow_back_into_bytecode() {
    with_vm(
        &app("SYSCALL -1 9\nLDC_I32_2\nMUL_I32\nSYSCALL 1 1"),
        &["app"],
        |vm| {
            let Ok(Outcome::Syscall(call)) = vm.execute() else {
                panic!("expected a syscall");
            };
            assert_eq!(call.sp_expected, STACK_CELLS - 1);
            vm.push_i32(21).unwrap();
            let Ok(Outcome::Syscall(call)) = vm.execute() else {
                panic!("expected a syscall");
            };
            assert_eq!(call.syscall, 1);
            assert_eq!(vm.pop_i32(), Ok(42));
            assert_eq!(vm.execute(), Ok(Outcome::Completed));
        },
    );
}

#[test]
fn syscall_adjustment_must_stay_on_the_stack() {
    assert!(matches!(
        run_err("SYSCALL 1 1"),
        VmError::InvalidProgram { .. }
    ));
}

#[test]
fn breakpoint_resumes_after_the_break() {
    with_vm(&app("LDC_I32_S 3\nBREAK\nSYSCALL 1 1"), &["app"], |vm| {
        assert_eq!(vm.execute(), Err(VmError::Breakpoint));
        assert_eq!(vm.stack_pointer(), STACK_CELLS - 1);
        assert!(matches!(vm.execute(), Ok(Outcome::Syscall(_))));
        assert_eq!(vm.pop_i32(), Ok(3));
        assert_eq!(vm.execute(), Ok(Outcome::Completed));
    });
}

#[test]
fn execute_after_completion_runs_nothing() {
    with_vm(&app("LDC_I32_1\nSYSCALL 1 1"), &["app"], |vm| {
        let mut out = Vec::new();
        while let Outcome::Syscall(call) = vm.execute().unwrap() {
            service(vm, call, &mut out);
        }
        assert_eq!(out, vec![Value::I32(1)]);
        assert_eq!(vm.execute(), Ok(Outcome::Completed));
    });
}

// ==================== Relocation ====================

#[test]
fn copied_arena_resumes_after_reattach() {
    let source = app("LDC_I32_S 11\nSYSCALL 1 1\nLDC_I32_S 22\nSYSCALL 1 1");
    let modules = assemble_program(&[source.as_str()]).unwrap();
    let mut first = aligned_buffer(ARENA);
    let snapshot = {
        let mut vm = Vm::initialize(&mut first, 0, 0).unwrap();
        import_all(&mut vm, &modules, &["app"]).unwrap();
        assert!(matches!(vm.execute(), Ok(Outcome::Syscall(_))));
        vm.arena_bytes().to_vec()
    };

    let mut second = aligned_buffer(ARENA);
    second.copy_from_slice(&snapshot);
    let mut vm = Vm::reattach(&mut second, &[modules[0].image.as_slice()]).unwrap();
    assert_eq!(vm.syscall(), 1);
    assert_eq!(vm.pop_i32(), Ok(11));
    assert!(matches!(vm.execute(), Ok(Outcome::Syscall(_))));
    assert_eq!(vm.pop_i32(), Ok(22));
    assert_eq!(vm.execute(), Ok(Outcome::Completed));
}

#[test]
fn reattach_checks_the_images() {
    let modules = assemble_program(&[app("NOP").as_str()]).unwrap();
    let other = assemble_program(&[app("NOP\nNOP").as_str()]).unwrap();
    let mut buf = aligned_buffer(ARENA);
    let snapshot = {
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        import_all(&mut vm, &modules, &[]).unwrap();
        vm.arena_bytes().to_vec()
    };

    let mut copy = aligned_buffer(ARENA);
    copy.copy_from_slice(&snapshot);
    assert!(matches!(
        Vm::reattach(&mut copy, &[]),
        Err(VmError::ArgumentInvalid { .. })
    ));
    assert!(matches!(
        Vm::reattach(&mut copy, &[other[0].image.as_slice()]),
        Err(VmError::ArgumentInvalid { .. })
    ));

    let mut blank = aligned_buffer(ARENA);
    assert!(matches!(
        Vm::reattach(&mut blank, &[modules[0].image.as_slice()]),
        Err(VmError::ArgumentInvalid { .. })
    ));
}

// ==================== Initializers ====================

/// Appends an initializer reporting `marker` to the host to `header`.
fn module_with_init(header: &str, marker: i32) -> String {
    format!(
        "{header}\n.init setup\n\
         .func setup safe\n    LDC_I32_S {marker}\n    SYSCALL 1 1\n    RET\n"
    )
}

const REPORTING_MAIN: &str = ".func main safe\n    LDC_I32_3\n    SYSCALL 1 1\n    RET\n";

#[test]
fn cyclic_imports_run_each_initializer_once() {
    let app = module_with_init(".module app\n.executable\n.import lib\n.main main", 1)
        + REPORTING_MAIN;
    let lib = module_with_init(".module lib\n.import app", 2);
    assert_eq!(
        run_program(&[app.as_str(), lib.as_str()], &["app", "lib"]).unwrap(),
        vec![Value::I32(2), Value::I32(1), Value::I32(3)]
    );
}

#[test]
fn initializers_run_dependencies_first() {
    let app = module_with_init(".module app\n.executable\n.import a\n.import b", 1);
    let a = module_with_init(".module a\n.import c", 2);
    let b = module_with_init(".module b", 3);
    let c = module_with_init(".module c", 4);
    let sources = [app.as_str(), a.as_str(), b.as_str(), c.as_str()];
    let order = run_program(&sources, &["app", "a", "b", "c"]).unwrap();
    // imports are queued in front of their importer, the last import first
    assert_eq!(
        order,
        vec![Value::I32(3), Value::I32(4), Value::I32(2), Value::I32(1)]
    );
}

#[test]
fn initializer_syscalls_suspend_and_resume() {
    let app = module_with_init(".module app\n.executable", 8);
    with_vm(&app, &["app"], |vm| {
        assert!(matches!(vm.execute(), Ok(Outcome::Syscall(_))));
        assert_eq!(vm.pop_i32(), Ok(8));
        assert_eq!(vm.execute(), Ok(Outcome::Completed));
    });
}

// ==================== Trust ====================

const SANDBOXED_APP: &str = "
.module app
.executable
.import lib
.main main
.func main
    LDC_I32_S 4
    CALL lib.report
    NOP
    RET
";

const TRUSTED_LIB: &str = "
.module lib
.func report args=1 safe
    LDLOC_X32 0
    SYSCALL 1 1
    CALL audit
    RET
.func audit critical
    RET
";

#[test]
fn sandboxed_code_cannot_syscall() {
    assert!(matches!(
        run_program(&[".module app\n.executable\n.main main\n.func main\n    SYSCALL 0 1\n    RET"], &["app"]),
        Err(VmError::SecurityViolation { module: 0, .. })
    ));
}

#[test]
fn safe_critical_requires_a_trusted_module() {
    assert!(matches!(
        run_program(&[app("NOP").as_str()], &[]),
        Err(VmError::SecurityViolation { .. })
    ));
}

#[test]
fn safe_critical_functions_elevate_sandboxed_callers() {
    assert_eq!(
        run_program(&[SANDBOXED_APP, TRUSTED_LIB], &["lib"]).unwrap(),
        vec![Value::I32(4)]
    );
    assert!(matches!(
        run_program(&[SANDBOXED_APP, TRUSTED_LIB], &[]),
        Err(VmError::SecurityViolation { .. })
    ));
}

#[test]
fn trust_is_revoked_on_return() {
    let app = SANDBOXED_APP.replace("    NOP\n", "    LDC_I32_1\n    SYSCALL 1 1\n");
    assert!(matches!(
        run_program(&[app.as_str(), TRUSTED_LIB], &["lib"]),
        Err(VmError::SecurityViolation { module: 0, .. })
    ));
}

#[test]
fn critical_functions_reject_sandboxed_callers() {
    let app = SANDBOXED_APP.replace("CALL lib.report", "CALL lib.audit");
    assert!(matches!(
        run_program(&[app.as_str(), TRUSTED_LIB], &["lib"]),
        Err(VmError::SecurityViolation { module: 0, .. })
    ));
}

#[test]
fn host_context_is_visible_per_module() {
    let modules = assemble_program(&[app("NOP").as_str()]).unwrap();
    let mut buf = aligned_buffer(ARENA);
    let mut vm = Vm::initialize(&mut buf, 0xABCD, 3).unwrap();
    assert_eq!(vm.context(), 0xABCD);
    assert_eq!(vm.flags(), 3);
    assert_eq!(vm.module_context(), None);
    vm.module_import(
        &modules[0].name,
        &modules[0].image,
        77,
        ImportFlags::SKIP_VERIFICATION | ImportFlags::TRUSTED_MODULE,
    )
    .unwrap();
    assert_eq!(vm.module_context(), Some(77));
    assert_eq!(vm.execute(), Ok(Outcome::Completed));
}
