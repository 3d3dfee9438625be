//! Interpreter loop and call-protocol benchmarks on hand-assembled modules.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use std::rc::Rc;

use tplvm::bytecode::CodeRef;
use tplvm::{
    CallSpec, Callable, CodeObject, Constant, Instruction, MemoryLoader, ModuleObject, OpCode,
    Runtime, Value,
};

fn op(op: OpCode) -> Instruction {
    Instruction::bare(op)
}

fn with_arg(op: OpCode, arg: i32) -> Instruction {
    Instruction::new(op, arg)
}

/// `total = 0; for i in range(n) { total = i + total }; return total`
fn sum_loop(n: i64) -> Rc<Callable> {
    let mut module = ModuleObject::new("sum");
    let zero = module.add_const(Constant::Int(0));
    let total = module.add_const(Constant::String("total".into()));
    let count = module.add_const(Constant::Int(n));
    let range = module.add_const(Constant::String("range".into()));
    module.add_code(CodeObject::new(
        "main",
        &[],
        vec![op(OpCode::LoadNull), op(OpCode::Return)],
    ));
    module.add_code(CodeObject::new(
        "sum",
        &[],
        vec![
            with_arg(OpCode::LoadConst, zero),
            with_arg(OpCode::StoreName, total),
            with_arg(OpCode::LoadConst, count),
            with_arg(OpCode::LoadGlobal, range),
            with_arg(OpCode::Call, CallSpec::new(1, false).operand()),
            op(OpCode::GetIter),
            with_arg(OpCode::ForIter, 11),
            with_arg(OpCode::LoadName, total),
            op(OpCode::Add),
            with_arg(OpCode::StoreName, total),
            with_arg(OpCode::Jump, 6),
            with_arg(OpCode::LoadName, total),
            op(OpCode::Return),
        ],
    ));
    entry(module, 1)
}

/// Call the native `length` directive `n` times.
fn directive_loop(n: i64) -> Rc<Callable> {
    let mut module = ModuleObject::new("calls");
    let count = module.add_const(Constant::Int(n));
    let range = module.add_const(Constant::String("range".into()));
    let text = module.add_const(Constant::String("abc".into()));
    let length = module.add_const(Constant::String("length".into()));
    module.add_code(CodeObject::new(
        "main",
        &[],
        vec![op(OpCode::LoadNull), op(OpCode::Return)],
    ));
    module.add_code(CodeObject::new(
        "loop",
        &[],
        vec![
            with_arg(OpCode::LoadConst, count),
            with_arg(OpCode::LoadGlobal, range),
            with_arg(OpCode::Call, CallSpec::new(1, false).operand()),
            op(OpCode::GetIter),
            with_arg(OpCode::ForIter, 11),
            op(OpCode::Pop),
            with_arg(OpCode::LoadConst, text),
            with_arg(OpCode::LoadGlobal, length),
            with_arg(OpCode::Call, CallSpec::new(1, false).operand()),
            op(OpCode::Pop),
            with_arg(OpCode::Jump, 4),
            op(OpCode::LoadNull),
            op(OpCode::Return),
        ],
    ));
    entry(module, 1)
}

fn entry(module: ModuleObject, index: usize) -> Rc<Callable> {
    let module = Rc::new(module.finish().expect("invalid module"));
    let code = CodeRef::new(module, index).expect("missing code object");
    Rc::new(Callable::from_code(code, IndexMap::new()))
}

fn run(runtime: &Runtime, callable: &Rc<Callable>) -> Value {
    runtime
        .exec_callable(callable, Vec::new(), None)
        .outcome()
        .expect("unsettled")
        .expect("runtime error")
}

fn bench_sum_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_loop");
    for n in [100, 1_000, 10_000] {
        let runtime = Runtime::with_loader(Rc::new(MemoryLoader::new()));
        let callable = sum_loop(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &callable, |b, callable| {
            b.iter(|| black_box(run(&runtime, callable)))
        });
    }
    group.finish();
}

fn bench_directive_calls(c: &mut Criterion) {
    let runtime = Runtime::with_loader(Rc::new(MemoryLoader::new()));
    let callable = directive_loop(1_000);
    c.bench_function("directive_calls_1000", |b| {
        b.iter(|| black_box(run(&runtime, &callable)))
    });
}

criterion_group!(benches, bench_sum_loop, bench_directive_calls);
criterion_main!(benches);
