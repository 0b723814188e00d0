use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use ipa::builder::ProgramBuilder;
use ipa::config::IpaConfig;
use ipa::dag::{AggDirection, AggOp, BinaryOp, DataKind};
use ipa::id::FunctionKey;
use ipa::pass::PassId;
use ipa::pipeline::{analyze_program, run_passes, AnalysisState};
use ipa::program::{Block, Program, DEFAULT_NAMESPACE};
use ipa::rules::StandardRules;

// Generated programs: `n` functions, each called once from main in its own
// block, half of them inside a loop that grows a matrix.

fn generate_program(n_functions: usize) -> Program {
    let mut b = ProgramBuilder::new();
    for i in 0..n_functions {
        let key = FunctionKey::new(DEFAULT_NAMESPACE, &format!("f{i}"));
        b.function(
            key,
            &[("A", DataKind::Matrix)],
            &[("B", DataKind::Matrix)],
            |b| {
                let a = b.read("A");
                let t = b.transpose(a);
                let a2 = b.read("A");
                let m = b.matmult(t, a2);
                let s = b.agg(AggOp::Sum, AggDirection::Row, m);
                let w = b.write("B", s);
                vec![ProgramBuilder::generic(vec![w])]
            },
        );
    }

    let x = b.matrix(1000, 40, None);
    let wx = b.write("X", x);
    b.push(ProgramBuilder::generic(vec![wx]));
    let ones = b.matrix(1000, 40, Some(1.0));
    let wo = b.write("ones", ones);
    b.push(ProgramBuilder::generic(vec![wo]));

    for i in 0..n_functions {
        let key = FunctionKey::new(DEFAULT_NAMESPACE, &format!("f{i}"));
        let arg = b.read("X");
        let out = format!("Y{i}");
        let call = b.call(&key, vec![arg], &[out.as_str()]);
        let call_block = ProgramBuilder::generic(vec![call]);
        if i % 2 == 0 {
            b.push(call_block);
            continue;
        }
        let p = b.lit(true);
        let r1 = b.read(&out);
        let r2 = b.read(&out);
        let grown = b.binary(BinaryOp::Rbind, r1, r2);
        let wg = b.write(&out, grown);
        b.push(Block::While {
            predicate: p,
            body: vec![call_block, ProgramBuilder::generic(vec![wg])],
        });
    }

    let rx = b.read("X");
    let ro = b.read("ones");
    let m = b.binary(BinaryOp::Mult, rx, ro);
    let wz = b.write("Z", m);
    b.push(ProgramBuilder::generic(vec![wz]));
    b.finish()
}

// Full analysis latency vs number of functions.
fn bench_full_analysis_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("ipa/full_analysis");
    let config = IpaConfig::default();

    for n in [1_usize, 10, 50, 200] {
        let program = generate_program(n);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}functions", n)),
            &program,
            |b, program| {
                b.iter_batched(
                    || program.clone(),
                    |mut program| {
                        let report = analyze_program(&mut program, &config, &StandardRules)
                            .expect("benchmark program must analyze");
                        black_box(report);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

// Pass-level latency on a mid-sized program.
fn bench_pass_latency(c: &mut Criterion) {
    let config = IpaConfig::default();
    let program = generate_program(50);

    for terminal in [PassId::SelectCandidates, PassId::Propagate, PassId::Checkpoints] {
        let mut group = c.benchmark_group(format!("ipa/pass_latency/{}", terminal.name()));
        group.bench_function("50functions", |b| {
            b.iter_batched(
                || program.clone(),
                |mut program| {
                    let mut state = AnalysisState::new(&mut program, &config);
                    run_passes(&mut state, terminal, &StandardRules, |_, _| {})
                        .expect("benchmark program must analyze");
                    black_box(&state.call_stats);
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }
}

criterion_group!(benches, bench_full_analysis_scaling, bench_pass_latency);
criterion_main!(benches);
