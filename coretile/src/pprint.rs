use prettytable::{self, format, row};
use std::fmt;

use crate::tiling::TilingResult;

/// Pretty-print a [TilingResult] to stdout.
pub fn pprint(tiling: &TilingResult) {
    pprint_table(tiling).printstd();
}

/// Pretty-print a [TilingResult] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(out: &mut W, tiling: &TilingResult) -> fmt::Result {
    write!(out, "{}", pprint_table(tiling))
}

pub fn pprint_string(tiling: &TilingResult) -> String {
    format!("{}", pprint_table(tiling))
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn pprint_table(tiling: &TilingResult) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Field", "Value"]);

    let single = &tiling.single;
    let l1 = &tiling.l1;
    let l0 = &tiling.l0;
    let pb = &tiling.double_buffer;
    table.add_row(row!["layout", tiling.layout()]);
    table.add_row(row!["blocking", tiling.blocking()]);
    table.add_row(row!["cost", tiling.block.cost.main]);
    table.add_row(row![
        "per core",
        format!(
            "batch={} group={} do={} ho={} wo={} m={} co1={}",
            single.batch, single.groups, single.dout, single.ho, single.wo, single.m, single.co1
        )
    ]);
    table.add_row(row!["L1 mode", tiling.l1_mode]);
    table.add_row(row![
        "L1 tile",
        format!(
            "kAL1={} kBL1={} mAL1={} nBL1={}",
            l1.k_al1, l1.k_bl1, l1.m_al1, l1.n_bl1
        )
    ]);
    table.add_row(row!["L0 tile", format!("m={} k={} n={}", l0.m, l0.k, l0.n)]);
    if let Some(sp) = &tiling.spatial {
        table.add_row(row![
            "rows x cols",
            format!(
                "L1 {}x{} L0 {}x{}",
                sp.ho_al1, sp.wo_al1, sp.ho_l0, sp.wo_l0
            )
        ]);
    }
    table.add_row(row![
        "buffers",
        format!(
            "AL1={} BL1={} AL0={} BL0={} CL0={}",
            pb.al1, pb.bl1, pb.al0, pb.bl0, pb.cl0
        )
    ]);
    table.add_row(row!["order", format!("{:?}", tiling.order)]);
    table.add_row(row![
        "bias/scale resident",
        format!(
            "{}/{}",
            yes_no(tiling.bias_full_load),
            yes_no(tiling.scale_full_load)
        )
    ]);
    table.add_row(row!["inner batch", tiling.inner_batch]);
    table.add_row(row!["pad compensation", yes_no(tiling.pad_compensation)]);
    table.add_row(row!["dispatch key", tiling.dispatch_key()]);

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;
    use crate::problem::ProblemShape;
    use crate::target::HardwareBudget;
    use nonzero::nonzero as nz;

    #[test]
    fn test_can_pprint_a_plan() {
        let problem = ProblemShape::matmul(nz!(128u32), nz!(64u32), nz!(64u32));
        let tiling = plan(&problem, &HardwareBudget::default()).unwrap();
        let s = pprint_string(&tiling);
        assert!(s.contains("dispatch key"));
        assert!(s.contains(&tiling.dispatch_key().to_string()));
        assert!(s.contains(&tiling.l1_mode.to_string()));
    }
}
