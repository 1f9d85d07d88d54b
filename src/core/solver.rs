use log::{trace, warn};
use serde::Serialize;

use super::tax::TaxTable;

pub const SEED_MULTIPLIER: f64 = 1.3;
pub const NET_TOLERANCE: f64 = 1.0;
pub const MAX_ITERATIONS: u32 = 20;
pub const BISECTION_ITERATIONS: u32 = 50;
pub const BISECTION_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrossUpSolution {
    pub gross: f64,
    pub tax_free: f64,
    pub taxable: f64,
    pub tax: f64,
    pub net: f64,
    pub iterations: u32,
    pub converged: bool,
}

impl GrossUpSolution {
    fn evaluate(
        gross: f64,
        tax_free_fraction: f64,
        existing_income: f64,
        table: &TaxTable,
    ) -> Self {
        let gross = gross.max(0.0);
        let tax_free = gross * tax_free_fraction;
        let taxable = gross - tax_free;
        let tax = table.marginal_tax(taxable, existing_income);
        Self {
            gross,
            tax_free,
            taxable,
            tax,
            net: gross - tax,
            iterations: 0,
            converged: false,
        }
    }

    pub fn is_capped(&self, available: f64) -> bool {
        self.gross >= available - 1e-9
    }
}

/// Net cash produced by withdrawing `gross` when `tax_free_fraction` of it is
/// untaxed and the rest is taxed on top of `existing_income`.
pub fn net_yield(gross: f64, tax_free_fraction: f64, existing_income: f64, table: &TaxTable) -> f64 {
    GrossUpSolution::evaluate(gross, tax_free_fraction, existing_income, table).net
}

/// Fixed-point gross-up for a split withdrawal. Seeds at `target * 1.3`,
/// rescales by `target / net` until within £1 of the target, and never
/// exceeds `available`. A capped or non-converged answer is returned as is.
pub fn solve_split_gross(
    target_net: f64,
    available: f64,
    tax_free_fraction: f64,
    existing_income: f64,
    table: &TaxTable,
) -> GrossUpSolution {
    if target_net <= 0.0 || available <= 0.0 {
        return GrossUpSolution {
            converged: true,
            ..GrossUpSolution::default()
        };
    }

    let mut gross = (target_net * SEED_MULTIPLIER).min(available);
    let mut solution = GrossUpSolution::evaluate(gross, tax_free_fraction, existing_income, table);

    for iteration in 1..=MAX_ITERATIONS {
        solution = GrossUpSolution::evaluate(gross, tax_free_fraction, existing_income, table);
        solution.iterations = iteration;
        trace!(
            "gross-up iteration {iteration}: gross {:.2} net {:.2} target {target_net:.2}",
            solution.gross, solution.net
        );

        if (solution.net - target_net).abs() < NET_TOLERANCE {
            solution.converged = true;
            return solution;
        }
        if solution.is_capped(available) && solution.net < target_net {
            solution.converged = true;
            return solution;
        }
        if solution.net <= 0.0 {
            break;
        }

        gross = (gross * target_net / solution.net).min(available);
    }

    warn!(
        "gross-up did not converge after {MAX_ITERATIONS} iterations: net {:.2} target {target_net:.2}",
        solution.net
    );
    solution
}

/// Bisection over `[0, available]` for the same problem as
/// [`solve_split_gross`].
pub fn solve_split_gross_bisection(
    target_net: f64,
    available: f64,
    tax_free_fraction: f64,
    existing_income: f64,
    table: &TaxTable,
) -> GrossUpSolution {
    if target_net <= 0.0 || available <= 0.0 {
        return GrossUpSolution {
            converged: true,
            ..GrossUpSolution::default()
        };
    }

    let ceiling = GrossUpSolution::evaluate(available, tax_free_fraction, existing_income, table);
    if ceiling.net <= target_net {
        return GrossUpSolution {
            converged: true,
            ..ceiling
        };
    }

    let mut lo = 0.0;
    let mut hi = available;
    let mut solution = ceiling;
    for iteration in 1..=BISECTION_ITERATIONS {
        let mid = (lo + hi) * 0.5;
        solution = GrossUpSolution::evaluate(mid, tax_free_fraction, existing_income, table);
        solution.iterations = iteration;
        if (solution.net - target_net).abs() < BISECTION_TOLERANCE {
            solution.converged = true;
            return solution;
        }
        if solution.net < target_net {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    trace!(
        "bisection stopped at gross {:.2} net {:.2} target {target_net:.2}",
        solution.gross, solution.net
    );
    solution
}

/// Fully taxable gross-up through the tax table, capped at `available`.
pub fn solve_taxable_gross(
    target_net: f64,
    available: f64,
    existing_income: f64,
    table: &TaxTable,
) -> GrossUpSolution {
    if target_net <= 0.0 || available <= 0.0 {
        return GrossUpSolution {
            converged: true,
            ..GrossUpSolution::default()
        };
    }

    let (gross, _) = table.gross_up(target_net, existing_income);
    let mut solution = GrossUpSolution::evaluate(gross.min(available), 0.0, existing_income, table);
    solution.iterations = 1;
    solution.converged = true;
    solution
}
