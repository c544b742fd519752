use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use nonzero::nonzero as nz;
use std::hint::black_box;

use coretile::common::DimSize;
use coretile::problem::{ConvDims, ProblemShape};
use coretile::search::block_dim_search;
use coretile::target::{HardwareBudget, TargetId};

#[export_name = "coretile_bench_search::conv_dims"]
fn conv_dims(batch: u32) -> ConvDims {
    ProblemShape::conv2d(
        DimSize::new(batch).unwrap(),
        nz!(256u32),
        nz!(256u32),
        [nz!(56u32), nz!(56u32)],
        [nz!(3u32), nz!(3u32)],
    )
    .dims()
    .unwrap()
}

#[library_benchmark]
#[benches::multiple(1, 32, 1024)]
fn search_conv2d(batch: u32) {
    let dims = conv_dims(black_box(batch));
    let budget = HardwareBudget::for_target(TargetId::Datacenter);
    black_box(block_dim_search(&dims, &budget).unwrap());
}

library_benchmark_group!(
    name = search_group;
    benchmarks = search_conv2d
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "toggle-collect=coretile_bench_search::conv_dims",
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = search_group
);
