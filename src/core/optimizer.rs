use log::debug;
use serde::Serialize;

use super::solver::{GrossUpSolution, solve_split_gross_bisection, solve_taxable_gross};
use super::tax::TaxTable;
use super::types::{CrystallisationStrategy, Person};

const PHASE_THRESHOLD: f64 = 0.01;

/// Running view of one person while the optimizer plans. Nothing here
/// touches the real ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonTaxState {
    pub state_pension: f64,
    pub taxable_income: f64,
    pub available_crystallised: f64,
    pub available_uncrystallised: f64,
    pub available_isa: f64,
    pub can_access_pension: bool,
    pub pcls_taken: bool,
}

impl PersonTaxState {
    pub fn new(person: &Person, state_pension: f64, year: i32) -> Self {
        Self {
            state_pension,
            taxable_income: state_pension,
            available_crystallised: person.crystallised_pot,
            available_uncrystallised: person.uncrystallised_pot,
            available_isa: person.available_isa(),
            can_access_pension: person.can_access_pension(year),
            pcls_taken: person.pcls_taken,
        }
    }

    pub fn available_pension(&self) -> f64 {
        if !self.can_access_pension {
            return 0.0;
        }
        self.available_crystallised + self.available_uncrystallised
    }

    /// Tax-free share of the pot the next withdrawal comes from.
    fn leading_fraction(&self, strategy: CrystallisationStrategy) -> f64 {
        let uncrystallised_fraction = strategy.tax_free_fraction(self.pcls_taken);
        match strategy {
            CrystallisationStrategy::Ufpls if self.available_uncrystallised > PHASE_THRESHOLD => {
                uncrystallised_fraction
            }
            CrystallisationStrategy::Gradual
                if self.available_crystallised <= PHASE_THRESHOLD
                    && self.available_uncrystallised > PHASE_THRESHOLD =>
            {
                uncrystallised_fraction
            }
            _ => 0.0,
        }
    }

    /// Gross withdrawal whose taxable part exactly fills `taxable_space`,
    /// limited by what is left in the pension.
    fn gross_space(&self, taxable_space: f64, strategy: CrystallisationStrategy) -> f64 {
        let fraction = self.leading_fraction(strategy);
        (taxable_space / (1.0 - fraction)).min(self.available_pension())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedWithdrawal {
    pub crystallised_drawn: f64,
    pub uncrystallised_drawn: f64,
    pub tax_free_from_pension: f64,
    pub taxable_from_pension: f64,
    pub from_isa: f64,
}

impl PlannedWithdrawal {
    fn record(&mut self, solution: &GrossUpSolution, from_uncrystallised: bool) {
        if from_uncrystallised {
            self.uncrystallised_drawn += solution.gross;
        } else {
            self.crystallised_drawn += solution.gross;
        }
        self.tax_free_from_pension += solution.tax_free;
        self.taxable_from_pension += solution.taxable;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedWithdrawalPlan {
    pub people: Vec<PlannedWithdrawal>,
    pub total_tax: f64,
    pub unmet: f64,
}

impl OptimizedWithdrawalPlan {
    pub fn total_taxable(&self) -> f64 {
        self.people.iter().map(|p| p.taxable_from_pension).sum()
    }

    pub fn total_net(&self) -> f64 {
        self.people
            .iter()
            .map(|p| p.tax_free_from_pension + p.taxable_from_pension + p.from_isa)
            .sum::<f64>()
            - self.total_tax
    }
}

/// Plans one year's withdrawals across everyone so that personal allowances
/// fill first, then the basic rate band, then higher bands, and savings last.
pub fn calculate_optimized_withdrawals(
    people: &[Person],
    net_needed: f64,
    year: i32,
    state_pension: &[f64],
    table: &TaxTable,
    strategy: CrystallisationStrategy,
) -> OptimizedWithdrawalPlan {
    let mut plan = OptimizedWithdrawalPlan {
        people: vec![PlannedWithdrawal::default(); people.len()],
        ..OptimizedWithdrawalPlan::default()
    };
    if net_needed <= 0.0 {
        return plan;
    }

    let mut states: Vec<PersonTaxState> = people
        .iter()
        .enumerate()
        .map(|(i, p)| PersonTaxState::new(p, state_pension.get(i).copied().unwrap_or(0.0), year))
        .collect();

    let mut remaining = net_needed;
    remaining = fill_personal_allowances(&mut states, &mut plan, remaining, table, strategy);
    debug!("optimizer after personal allowances: {remaining:.2} still needed");

    if remaining > PHASE_THRESHOLD {
        remaining = fill_basic_rate_band(&mut states, &mut plan, remaining, table, strategy);
        debug!("optimizer after basic rate band: {remaining:.2} still needed");
    }
    if remaining > PHASE_THRESHOLD {
        remaining = proportional_pension_withdrawals(&mut states, &mut plan, remaining, table, strategy);
        debug!("optimizer after higher bands: {remaining:.2} still needed");
    }
    remaining = withdraw_from_isas(&mut states, &mut plan, remaining);

    plan.unmet = remaining.max(0.0);
    plan.total_tax = states
        .iter()
        .zip(&plan.people)
        .map(|(state, planned)| table.total_tax(state.state_pension + planned.taxable_from_pension))
        .sum();
    plan
}

fn fill_personal_allowances(
    states: &mut [PersonTaxState],
    plan: &mut OptimizedWithdrawalPlan,
    mut remaining: f64,
    table: &TaxTable,
    strategy: CrystallisationStrategy,
) -> f64 {
    let allowance = table.personal_allowance();
    let spaces: Vec<f64> = states
        .iter()
        .map(|state| {
            let taxable_space = (allowance - state.taxable_income).max(0.0);
            state.gross_space(taxable_space, strategy)
        })
        .collect();
    let total_space: f64 = spaces.iter().sum();
    if total_space <= 0.0 {
        return remaining;
    }

    let to_withdraw = remaining.min(total_space);
    for (i, space) in spaces.into_iter().enumerate() {
        if remaining <= PHASE_THRESHOLD {
            break;
        }
        if space <= 0.0 {
            continue;
        }
        let target = (to_withdraw * space / total_space).min(space).min(remaining);
        if target > PHASE_THRESHOLD {
            remaining -= simple_withdraw_pension(&mut states[i], &mut plan.people[i], target, table, strategy);
        }
    }
    remaining
}

fn fill_basic_rate_band(
    states: &mut [PersonTaxState],
    plan: &mut OptimizedWithdrawalPlan,
    mut remaining: f64,
    table: &TaxTable,
    strategy: CrystallisationStrategy,
) -> f64 {
    let band = table.basic_rate_band();
    let spaces: Vec<(f64, f64)> = states
        .iter()
        .map(|state| {
            if state.taxable_income >= band.upper {
                return (0.0, 0.0);
            }
            let taxable_space = band.upper - state.taxable_income.max(band.lower);
            let fraction = state.leading_fraction(strategy);
            let retention = fraction + (1.0 - fraction) * (1.0 - band.rate);
            (state.gross_space(taxable_space.max(0.0), strategy), retention)
        })
        .collect();
    let total_space: f64 = spaces.iter().map(|(space, _)| space).sum();
    if total_space <= 0.0 {
        return remaining;
    }

    let blended_retention: f64 = spaces
        .iter()
        .map(|(space, retention)| space / total_space * retention)
        .sum();
    let to_withdraw = (remaining / blended_retention).min(total_space);

    for (i, (space, retention)) in spaces.into_iter().enumerate() {
        if remaining <= PHASE_THRESHOLD {
            break;
        }
        if space <= 0.0 {
            continue;
        }
        let gross = (to_withdraw * space / total_space).min(space);
        let target = (gross * retention).min(remaining);
        if target > PHASE_THRESHOLD {
            remaining -= simple_withdraw_pension(&mut states[i], &mut plan.people[i], target, table, strategy);
        }
    }
    remaining
}

/// Shares are fixed from a single snapshot of available pension taken before
/// anyone withdraws; each share is applied to whatever is still needed when
/// that person's turn comes.
fn proportional_pension_withdrawals(
    states: &mut [PersonTaxState],
    plan: &mut OptimizedWithdrawalPlan,
    mut remaining: f64,
    table: &TaxTable,
    strategy: CrystallisationStrategy,
) -> f64 {
    let snapshot: Vec<f64> = states.iter().map(PersonTaxState::available_pension).collect();
    let total_available: f64 = snapshot.iter().sum();
    if total_available <= PHASE_THRESHOLD {
        return remaining;
    }

    for (i, available) in snapshot.into_iter().enumerate() {
        if remaining <= PHASE_THRESHOLD {
            break;
        }
        if available <= PHASE_THRESHOLD {
            continue;
        }
        let target = remaining * available / total_available;
        if target > PHASE_THRESHOLD {
            remaining -= simple_withdraw_pension(&mut states[i], &mut plan.people[i], target, table, strategy);
        }
    }
    remaining
}

fn withdraw_from_isas(
    states: &mut [PersonTaxState],
    plan: &mut OptimizedWithdrawalPlan,
    mut remaining: f64,
) -> f64 {
    if remaining <= PHASE_THRESHOLD {
        return remaining;
    }
    let total_isa: f64 = states.iter().map(|s| s.available_isa).sum();
    if total_isa <= 0.0 {
        return remaining;
    }

    let isa_needed = remaining.min(total_isa);
    for (state, planned) in states.iter_mut().zip(plan.people.iter_mut()) {
        if state.available_isa <= 0.0 {
            continue;
        }
        let withdrawal = (isa_needed * state.available_isa / total_isa).min(state.available_isa);
        state.available_isa -= withdrawal;
        planned.from_isa += withdrawal;
        remaining -= withdrawal;
    }
    remaining
}

/// Draws `net_needed` from one person's pension and returns the net actually
/// planned. UFPLS prefers the uncrystallised pot; gradual uses the
/// crystallised pot before crystallising more.
fn simple_withdraw_pension(
    state: &mut PersonTaxState,
    planned: &mut PlannedWithdrawal,
    net_needed: f64,
    table: &TaxTable,
    strategy: CrystallisationStrategy,
) -> f64 {
    if net_needed <= 0.0 || !state.can_access_pension {
        return 0.0;
    }
    let mut received = 0.0;

    if strategy == CrystallisationStrategy::Ufpls {
        received += draw_uncrystallised(state, planned, net_needed, table, strategy);
    }

    if state.available_crystallised > PHASE_THRESHOLD && received < net_needed {
        let solution = solve_taxable_gross(
            net_needed - received,
            state.available_crystallised,
            state.taxable_income,
            table,
        );
        if solution.gross > PHASE_THRESHOLD {
            state.available_crystallised -= solution.gross;
            state.taxable_income += solution.taxable;
            planned.record(&solution, false);
            received += solution.net;
        }
    }

    if strategy == CrystallisationStrategy::Gradual && received < net_needed {
        received += draw_uncrystallised(state, planned, net_needed - received, table, strategy);
    }

    received
}

fn draw_uncrystallised(
    state: &mut PersonTaxState,
    planned: &mut PlannedWithdrawal,
    net_needed: f64,
    table: &TaxTable,
    strategy: CrystallisationStrategy,
) -> f64 {
    if state.available_uncrystallised <= PHASE_THRESHOLD {
        return 0.0;
    }
    let fraction = strategy.tax_free_fraction(state.pcls_taken);
    let solution = if fraction > 0.0 {
        solve_split_gross_bisection(
            net_needed,
            state.available_uncrystallised,
            fraction,
            state.taxable_income,
            table,
        )
    } else {
        solve_taxable_gross(net_needed, state.available_uncrystallised, state.taxable_income, table)
    };
    if solution.gross <= PHASE_THRESHOLD {
        return 0.0;
    }

    state.available_uncrystallised -= solution.gross;
    state.taxable_income += solution.taxable;
    planned.record(&solution, true);
    solution.net
}
