use iai_callgrind::{library_benchmark, library_benchmark_group, main};
use nonzero::nonzero as nz;
use std::hint::black_box;

use coretile::plan;
use coretile::problem::ProblemShape;
use coretile::target::{HardwareBudget, TargetId};

#[library_benchmark]
fn plan_resnet_block() {
    let problem = ProblemShape::conv2d(
        nz!(16u32),
        nz!(512u32),
        nz!(512u32),
        [nz!(14u32), nz!(14u32)],
        [nz!(3u32), nz!(3u32)],
    );
    let budget = HardwareBudget::for_target(TargetId::Standard);
    black_box(plan(black_box(&problem), &budget).unwrap());
}

#[library_benchmark]
fn plan_matmul() {
    let problem = ProblemShape::matmul(nz!(4096u32), nz!(1024u32), nz!(1024u32));
    let budget = HardwareBudget::for_target(TargetId::Edge);
    black_box(plan(black_box(&problem), &budget).unwrap());
}

library_benchmark_group!(
    name = plan_group;
    benchmarks = plan_resnet_block, plan_matmul
);

main!(library_benchmark_groups = plan_group);
