use log::debug;

use super::crystallisation::{deposit_to_isa, withdraw_from_crystallised, withdraw_from_isa};
use super::optimizer::calculate_optimized_withdrawals;
use super::solver::{solve_split_gross, solve_taxable_gross};
use super::tax::TaxTable;
use super::types::{CrystallisationStrategy, DrawdownOrder, Person, SimulationParams, WithdrawalBreakdown};

const REMAINING_TOLERANCE: f64 = 1.0;
const MIN_WITHDRAWAL: f64 = 1.0;
/// Upper bound on the pass-until-no-progress loops so they always terminate.
const MAX_PASSES: u32 = 8;

/// Everything a policy needs besides the ledgers and the breakdown.
#[derive(Debug, Clone, Copy)]
struct DrawdownContext<'a> {
    year: i32,
    state_pension: &'a [f64],
    table: &'a TaxTable,
    strategy: CrystallisationStrategy,
}

impl DrawdownContext<'_> {
    fn state_pension(&self, index: usize) -> f64 {
        self.state_pension.get(index).copied().unwrap_or(0.0)
    }

    fn existing_income(&self, index: usize, breakdown: &WithdrawalBreakdown) -> f64 {
        self.state_pension(index) + breakdown.taxable_for(index)
    }

    /// Taxable withdrawal that takes this person exactly to the top of the
    /// basic rate band.
    fn basic_rate_headroom(&self, index: usize) -> f64 {
        (self.table.basic_rate_limit() - self.state_pension(index)).max(0.0)
    }

    fn anyone_receives_state_pension(&self, people: usize) -> bool {
        (0..people).any(|i| self.state_pension(i) > 0.0)
    }
}

/// Runs one year of the chosen drawdown policy, mutating `people` in place.
/// Short falls are silent: the breakdown simply nets less than requested.
pub fn execute_drawdown(
    people: &mut [Person],
    net_needed: f64,
    params: &SimulationParams,
    year: i32,
    state_pension: &[f64],
    table: &TaxTable,
) -> WithdrawalBreakdown {
    let ctx = DrawdownContext {
        year,
        state_pension,
        table,
        strategy: params.crystallisation,
    };
    debug!(
        "{year}: {} ({:?}) for net {net_needed:.2}",
        params.drawdown_order.label(),
        params.crystallisation
    );

    let mut breakdown = WithdrawalBreakdown::for_people(people);
    match params.drawdown_order {
        DrawdownOrder::SavingsFirst => {
            let remaining = withdraw_from_isas(people, net_needed, &mut breakdown);
            withdraw_from_pension_grossed_up(people, remaining, &ctx, &mut breakdown);
        }
        DrawdownOrder::PensionFirst => {
            let remaining = withdraw_from_pension_grossed_up(people, net_needed, &ctx, &mut breakdown);
            withdraw_from_isas(people, remaining, &mut breakdown);
        }
        DrawdownOrder::PensionOnly => {
            withdraw_from_pension_grossed_up(people, net_needed, &ctx, &mut breakdown);
        }
        DrawdownOrder::TaxOptimized => {
            execute_optimized(people, net_needed, &ctx, &mut breakdown);
        }
        DrawdownOrder::PensionToIsa => {
            execute_pension_to_isa(people, net_needed, &ctx, params.maximize_couple_isa, &mut breakdown);
        }
        DrawdownOrder::PensionToIsaProactive => {
            if net_needed > 0.0 {
                execute_pension_to_isa(people, net_needed, &ctx, params.maximize_couple_isa, &mut breakdown);
            } else {
                execute_proactive_isa_fill(people, &ctx, &mut breakdown);
            }
        }
        DrawdownOrder::FillBasicRate => {
            execute_fill_basic_rate(people, net_needed, &ctx, &mut breakdown);
        }
        DrawdownOrder::StatePensionBridge => {
            execute_state_pension_bridge(people, net_needed, &ctx, &mut breakdown);
        }
    }

    debug!(
        "{year}: tax-free {:.2}, taxable {:.2}, deposited {:.2}",
        breakdown.total_tax_free(),
        breakdown.total_taxable(),
        breakdown.total_isa_deposits()
    );
    breakdown
}

/// Net cash the pension withdrawals in `breakdown` produced, counting only
/// the tax those withdrawals add on top of each person's state pension.
pub fn net_from_pension(breakdown: &WithdrawalBreakdown, state_pension: &[f64], table: &TaxTable) -> f64 {
    breakdown
        .people
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let baseline = state_pension.get(i).copied().unwrap_or(0.0);
            p.tax_free_from_pension + p.taxable_from_pension
                - table.marginal_tax(p.taxable_from_pension, baseline)
        })
        .sum()
}

fn execute_optimized(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) {
    if net_needed <= 0.0 {
        return;
    }

    let plan = calculate_optimized_withdrawals(
        people,
        net_needed,
        ctx.year,
        ctx.state_pension,
        ctx.table,
        ctx.strategy,
    );
    debug!(
        "optimized plan: taxable {:.2}, tax {:.2}, unmet {:.2}",
        plan.total_taxable(),
        plan.total_tax,
        plan.unmet
    );

    for ((person, planned), entry) in people
        .iter_mut()
        .zip(&plan.people)
        .zip(breakdown.people.iter_mut())
    {
        entry.tax_free_from_isa += withdraw_from_isa(person, planned.from_isa);
        if planned.crystallised_drawn > 0.0 {
            entry.taxable_from_pension += withdraw_from_crystallised(person, planned.crystallised_drawn);
        }
        if planned.uncrystallised_drawn > 0.0 {
            let result = ctx.strategy.crystallise(person, planned.uncrystallised_drawn);
            entry.tax_free_from_pension += result.tax_free_portion;
            entry.taxable_from_pension += result.taxable_portion;
        }
    }
}

fn execute_pension_to_isa(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext,
    maximize_couple_isa: bool,
    breakdown: &mut WithdrawalBreakdown,
) {
    if net_needed <= 0.0 {
        return;
    }

    fill_tax_bands(people, ctx, breakdown, |i| ctx.basic_rate_headroom(i));
    let mut net = net_from_pension(breakdown, ctx.state_pension, ctx.table);

    if maximize_couple_isa {
        let total_ceiling: f64 = people.iter().map(|p| p.isa_annual_limit.max(0.0)).sum();
        let excess = net - net_needed;
        if excess >= 0.0 && excess < total_ceiling {
            top_up_for_isa_ceilings(people, total_ceiling - excess, ctx, breakdown);
            net = net_from_pension(breakdown, ctx.state_pension, ctx.table);
        }
    }

    if net > net_needed {
        deposit_surplus_evenly(people, net - net_needed, breakdown);
    } else if net < net_needed {
        let shortfall = withdraw_from_isas(people, net_needed - net, breakdown);
        if shortfall > REMAINING_TOLERANCE {
            withdraw_from_pension_grossed_up(people, shortfall, ctx, breakdown);
        }
    }
}

/// With nothing to spend, draw just enough inside the basic rate band to
/// fill the remaining savings ceilings and deposit all of it.
fn execute_proactive_isa_fill(
    people: &mut [Person],
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) {
    let mut room: f64 = people.iter().map(|p| p.isa_annual_limit.max(0.0)).sum();
    if room <= REMAINING_TOLERANCE {
        return;
    }

    for (i, person) in people.iter_mut().enumerate() {
        if room <= REMAINING_TOLERANCE {
            break;
        }
        if !person.can_access_pension(ctx.year) {
            continue;
        }
        let headroom = ctx.basic_rate_headroom(i);
        if headroom <= 0.0 {
            continue;
        }

        let fraction = ctx.strategy.tax_free_fraction(person.pcls_taken);
        let existing = ctx.existing_income(i, breakdown);
        let gross_cap = (headroom / (1.0 - fraction)).min(person.uncrystallised_pot);
        let solution = solve_split_gross(room, gross_cap, fraction, existing, ctx.table);
        if solution.gross >= MIN_WITHDRAWAL {
            let result = ctx.strategy.crystallise(person, solution.gross);
            let entry = &mut breakdown.people[i];
            entry.tax_free_from_pension += result.tax_free_portion;
            entry.taxable_from_pension += result.taxable_portion;
            room -= result.total() - ctx.table.marginal_tax(result.taxable_portion, existing);
        }

        let taxable_left = headroom - breakdown.taxable_for(i);
        if room > REMAINING_TOLERANCE && taxable_left > 0.0 && person.crystallised_pot > 0.0 {
            let existing = ctx.existing_income(i, breakdown);
            let available = taxable_left.min(person.crystallised_pot);
            let solution = solve_taxable_gross(room, available, existing, ctx.table);
            let actual = withdraw_from_crystallised(person, solution.gross);
            breakdown.people[i].taxable_from_pension += actual;
            room -= actual - ctx.table.marginal_tax(actual, existing);
        }
    }

    let proceeds = net_from_pension(breakdown, ctx.state_pension, ctx.table);
    if proceeds > 0.0 {
        deposit_surplus_evenly(people, proceeds, breakdown);
    }
}

fn execute_fill_basic_rate(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) {
    fill_tax_bands(people, ctx, breakdown, |i| ctx.basic_rate_headroom(i));
    settle_in_order(people, net_needed.max(0.0), ctx, breakdown);
}

fn execute_state_pension_bridge(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) {
    if net_needed <= 0.0 {
        return;
    }

    if ctx.anyone_receives_state_pension(people.len()) {
        let remaining = withdraw_from_pension_grossed_up(people, net_needed, ctx, breakdown);
        withdraw_from_isas(people, remaining, breakdown);
        return;
    }

    fill_tax_bands(people, ctx, breakdown, |i| ctx.basic_rate_headroom(i));
    settle_in_order(people, net_needed, ctx, breakdown);
}

/// Surplus over the need goes to savings person by person; a shortfall comes
/// from savings in the same order and then from more pension.
fn settle_in_order(
    people: &mut [Person],
    net_needed: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) {
    let net = net_from_pension(breakdown, ctx.state_pension, ctx.table);
    if net > net_needed {
        deposit_surplus_in_order(people, net - net_needed, breakdown);
        return;
    }

    let mut shortfall = net_needed - net;
    for (person, entry) in people.iter_mut().zip(breakdown.people.iter_mut()) {
        if shortfall <= 0.0 {
            break;
        }
        let taken = withdraw_from_isa(person, shortfall);
        entry.tax_free_from_isa += taken;
        shortfall -= taken;
    }
    if shortfall > REMAINING_TOLERANCE {
        withdraw_from_pension_grossed_up(people, shortfall, ctx, breakdown);
    }
}

/// Draws each accessible person's pension until their taxable withdrawals
/// reach `target(index)`. The uncrystallised pot is used first, grossed so
/// that its taxable part lands on the target, then the crystallised pot
/// tops up.
fn fill_tax_bands<F>(people: &mut [Person], ctx: &DrawdownContext, breakdown: &mut WithdrawalBreakdown, target: F)
where
    F: Fn(usize) -> f64,
{
    for (i, person) in people.iter_mut().enumerate() {
        if !person.can_access_pension(ctx.year) {
            continue;
        }
        let target_taxable = target(i);
        if target_taxable <= 0.0 {
            continue;
        }

        let fraction = ctx.strategy.tax_free_fraction(person.pcls_taken);
        let amount = (target_taxable / (1.0 - fraction)).min(person.uncrystallised_pot);
        if amount > 0.0 {
            let result = ctx.strategy.crystallise(person, amount);
            let entry = &mut breakdown.people[i];
            entry.tax_free_from_pension += result.tax_free_portion;
            entry.taxable_from_pension += result.taxable_portion;
        }

        let taxable_so_far = breakdown.taxable_for(i);
        if person.crystallised_pot > 0.0 && taxable_so_far < target_taxable {
            let actual = withdraw_from_crystallised(person, target_taxable - taxable_so_far);
            breakdown.people[i].taxable_from_pension += actual;
        }
    }
}

/// Extra draw so that, once tax is paid at each person's real marginal rate,
/// `additional_net` more arrives to fill unused savings ceilings.
fn top_up_for_isa_ceilings(
    people: &mut [Person],
    mut additional_net: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) {
    for (i, person) in people.iter_mut().enumerate() {
        if additional_net <= REMAINING_TOLERANCE {
            break;
        }
        if !person.can_access_pension(ctx.year) || person.total_pension() <= 0.0 {
            continue;
        }

        if person.uncrystallised_pot > 0.0 {
            let existing = ctx.existing_income(i, breakdown);
            let fraction = ctx.strategy.tax_free_fraction(person.pcls_taken);
            let solution = solve_split_gross(
                additional_net,
                person.uncrystallised_pot,
                fraction,
                existing,
                ctx.table,
            );
            let result = ctx.strategy.crystallise(person, solution.gross);
            let entry = &mut breakdown.people[i];
            entry.tax_free_from_pension += result.tax_free_portion;
            entry.taxable_from_pension += result.taxable_portion;
            additional_net -= result.total() - ctx.table.marginal_tax(result.taxable_portion, existing);
        }

        if additional_net > REMAINING_TOLERANCE && person.crystallised_pot > 0.0 {
            let existing = ctx.existing_income(i, breakdown);
            let solution = solve_taxable_gross(additional_net, person.crystallised_pot, existing, ctx.table);
            let actual = withdraw_from_crystallised(person, solution.gross);
            breakdown.people[i].taxable_from_pension += actual;
            additional_net -= actual - ctx.table.marginal_tax(actual, existing);
        }
    }
}

/// Takes from everyone's savings in proportion to what each can spare.
/// Returns what is still needed.
fn withdraw_from_isas(people: &mut [Person], mut remaining: f64, breakdown: &mut WithdrawalBreakdown) -> f64 {
    if remaining <= REMAINING_TOLERANCE {
        return remaining;
    }
    let total_available: f64 = people.iter().map(Person::available_isa).sum();
    if total_available <= 0.0 {
        return remaining;
    }

    let isa_needed = remaining.min(total_available);
    for (person, entry) in people.iter_mut().zip(breakdown.people.iter_mut()) {
        let available = person.available_isa();
        if available <= 0.0 {
            continue;
        }
        let share = (isa_needed * available / total_available).min(available);
        let taken = withdraw_from_isa(person, share);
        entry.tax_free_from_isa += taken;
        remaining -= taken;
    }
    remaining
}

/// Grosses withdrawals up so the net covers `remaining`, looping over people
/// until the need is met or no pot makes progress. Gradual drains the
/// crystallised pot before crystallising more; UFPLS goes to the
/// uncrystallised pot first. Returns what is still needed.
fn withdraw_from_pension_grossed_up(
    people: &mut [Person],
    remaining: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    if remaining <= 0.0 {
        return 0.0;
    }
    match ctx.strategy {
        CrystallisationStrategy::Gradual => {
            let remaining = draw_crystallised_pots(people, remaining, ctx, breakdown);
            draw_uncrystallised_pots(people, remaining, ctx, breakdown)
        }
        CrystallisationStrategy::Ufpls => {
            let remaining = draw_uncrystallised_pots(people, remaining, ctx, breakdown);
            draw_crystallised_pots(people, remaining, ctx, breakdown)
        }
    }
}

fn draw_crystallised_pots(
    people: &mut [Person],
    mut remaining: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    for _ in 0..MAX_PASSES {
        if remaining <= REMAINING_TOLERANCE {
            break;
        }
        let mut progressed = false;
        for (i, person) in people.iter_mut().enumerate() {
            if remaining <= REMAINING_TOLERANCE
                || !person.can_access_pension(ctx.year)
                || person.crystallised_pot <= 0.0
            {
                continue;
            }
            let existing = ctx.existing_income(i, breakdown);
            let solution = solve_taxable_gross(remaining, person.crystallised_pot, existing, ctx.table);
            if solution.gross < MIN_WITHDRAWAL {
                continue;
            }
            let actual = withdraw_from_crystallised(person, solution.gross);
            breakdown.people[i].taxable_from_pension += actual;
            remaining -= actual - ctx.table.marginal_tax(actual, existing);
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
    remaining
}

fn draw_uncrystallised_pots(
    people: &mut [Person],
    mut remaining: f64,
    ctx: &DrawdownContext,
    breakdown: &mut WithdrawalBreakdown,
) -> f64 {
    for _ in 0..MAX_PASSES {
        if remaining <= REMAINING_TOLERANCE {
            break;
        }
        let mut progressed = false;
        for (i, person) in people.iter_mut().enumerate() {
            if remaining <= REMAINING_TOLERANCE
                || !person.can_access_pension(ctx.year)
                || person.uncrystallised_pot <= 0.0
            {
                continue;
            }
            let existing = ctx.existing_income(i, breakdown);
            let fraction = ctx.strategy.tax_free_fraction(person.pcls_taken);
            let solution = solve_split_gross(remaining, person.uncrystallised_pot, fraction, existing, ctx.table);
            if solution.gross < MIN_WITHDRAWAL {
                continue;
            }
            let result = ctx.strategy.crystallise(person, solution.gross);
            let entry = &mut breakdown.people[i];
            entry.tax_free_from_pension += result.tax_free_portion;
            entry.taxable_from_pension += result.taxable_portion;
            remaining -= result.total() - ctx.table.marginal_tax(result.taxable_portion, existing);
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
    remaining
}

/// Splits `surplus` evenly across everyone, capped at each savings ceiling,
/// then offers what is left to anyone with room. Money that fits nowhere is
/// not recorded.
fn deposit_surplus_evenly(people: &mut [Person], surplus: f64, breakdown: &mut WithdrawalBreakdown) {
    if surplus <= 0.0 || people.is_empty() {
        return;
    }
    let even_share = surplus / people.len() as f64;
    let mut left = surplus;

    for (person, entry) in people.iter_mut().zip(breakdown.people.iter_mut()) {
        let room = (person.isa_annual_limit - entry.isa_deposit).max(0.0);
        let deposit = even_share.min(room).min(left);
        deposit_to_isa(person, deposit);
        entry.isa_deposit += deposit;
        left -= deposit;
    }
    for (person, entry) in people.iter_mut().zip(breakdown.people.iter_mut()) {
        if left <= 0.0 {
            break;
        }
        let room = (person.isa_annual_limit - entry.isa_deposit).max(0.0);
        let deposit = left.min(room);
        deposit_to_isa(person, deposit);
        entry.isa_deposit += deposit;
        left -= deposit;
    }
}

fn deposit_surplus_in_order(people: &mut [Person], surplus: f64, breakdown: &mut WithdrawalBreakdown) {
    let mut left = surplus;
    for (person, entry) in people.iter_mut().zip(breakdown.people.iter_mut()) {
        if left <= 0.0 {
            break;
        }
        let room = (person.isa_annual_limit - entry.isa_deposit).max(0.0);
        let deposit = left.min(room);
        deposit_to_isa(person, deposit);
        entry.isa_deposit += deposit;
        left -= deposit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MortgageOption;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn params(order: DrawdownOrder, strategy: CrystallisationStrategy) -> SimulationParams {
        SimulationParams::new(strategy, order, MortgageOption::Normal)
    }

    fn retiree(name: &str, uncrystallised: f64, savings: f64) -> Person {
        let mut person = Person::new(name, 1960, 55);
        person.uncrystallised_pot = uncrystallised;
        person.tax_free_savings = savings;
        person
    }

    fn total_balance(people: &[Person]) -> f64 {
        people.iter().map(Person::total_wealth).sum()
    }

    /// Net received this year, with tax charged only on the pension part.
    fn net_received(breakdown: &WithdrawalBreakdown, state_pension: &[f64], table: &TaxTable) -> f64 {
        net_from_pension(breakdown, state_pension, table) + breakdown.total_from_isa()
            - breakdown.total_isa_deposits()
    }

    #[test]
    fn savings_first_uses_savings_before_pension() {
        let mut people = vec![retiree("A", 200_000.0, 30_000.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::SavingsFirst, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(breakdown.total_from_isa(), 20_000.0);
        assert_approx(breakdown.total_from_pension(), 0.0);
        assert_approx(people[0].tax_free_savings, 10_000.0);
    }

    #[test]
    fn savings_first_falls_back_to_pension() {
        let mut people = vec![retiree("A", 200_000.0, 5_000.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::SavingsFirst, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(breakdown.total_from_isa(), 5_000.0);
        assert_approx_tol(net_received(&breakdown, &[0.0], &table), 20_000.0, 1.0);
        assert!(people[0].uncrystallised_pot < 200_000.0);
    }

    #[test]
    fn pension_first_saves_isa_for_last() {
        let mut people = vec![retiree("A", 200_000.0, 30_000.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::PensionFirst, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(breakdown.total_from_isa(), 0.0);
        assert_approx_tol(net_from_pension(&breakdown, &[0.0], &table), 20_000.0, 1.0);
        assert_approx(people[0].tax_free_savings, 30_000.0);
    }

    #[test]
    fn gradual_drains_crystallised_pot_first() {
        let mut person = retiree("A", 100_000.0, 0.0);
        person.crystallised_pot = 50_000.0;
        let mut people = vec![person];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            10_000.0,
            &params(DrawdownOrder::PensionFirst, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(people[0].uncrystallised_pot, 100_000.0);
        assert_approx(breakdown.people[0].tax_free_from_pension, 0.0);
        assert_approx_tol(breakdown.total_taxable(), 10_000.0, 1.0);
    }

    #[test]
    fn ufpls_uses_uncrystallised_pot_first() {
        let mut person = retiree("A", 100_000.0, 0.0);
        person.crystallised_pot = 50_000.0;
        let mut people = vec![person];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            10_000.0,
            &params(DrawdownOrder::PensionFirst, CrystallisationStrategy::Ufpls),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(people[0].crystallised_pot, 50_000.0);
        assert_approx_tol(breakdown.people[0].tax_free_from_pension, 2_500.0, 1.0);
    }

    #[test]
    fn pension_first_carries_need_to_next_person_when_pot_runs_out() {
        let mut people = vec![retiree("A", 8_000.0, 0.0), retiree("B", 200_000.0, 0.0)];
        let table = TaxTable::uk_default();
        let state_pension = [0.0, 0.0];
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::PensionFirst, CrystallisationStrategy::Gradual),
            2026,
            &state_pension,
            &table,
        );

        assert_approx(people[0].uncrystallised_pot, 0.0);
        assert_approx(breakdown.people[0].gross_withdrawn(), 8_000.0);
        assert_approx_tol(breakdown.people[1].gross_withdrawn(), 12_000.0, 1.0);
        assert_approx_tol(people[1].uncrystallised_pot, 188_000.0, 1.0);
        assert_approx_tol(net_received(&breakdown, &state_pension, &table), 20_000.0, 1.0);
        assert_approx(breakdown.total_from_isa(), 0.0);
    }

    #[test]
    fn ufpls_falls_back_to_crystallised_pot_when_uncrystallised_runs_short() {
        let mut person = retiree("A", 8_000.0, 0.0);
        person.crystallised_pot = 50_000.0;
        let mut people = vec![person];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::PensionFirst, CrystallisationStrategy::Ufpls),
            2026,
            &[0.0],
            &table,
        );

        // The 8,000 UFPLS draw is untaxed; the crystallised draw sits on its 6,000 taxable.
        assert_approx(people[0].uncrystallised_pot, 0.0);
        assert_approx(breakdown.people[0].tax_free_from_pension, 2_000.0);
        assert_approx_tol(people[0].crystallised_pot, 50_000.0 - 13_357.5, 1.0);
        assert_approx_tol(net_received(&breakdown, &[0.0], &table), 20_000.0, 1.0);
    }

    #[test]
    fn pension_only_never_touches_savings_on_shortfall() {
        let mut people = vec![retiree("A", 5_000.0, 50_000.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::PensionOnly, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(breakdown.total_from_isa(), 0.0);
        assert_approx(people[0].tax_free_savings, 50_000.0);
        assert_approx(people[0].uncrystallised_pot, 0.0);
        assert_approx(breakdown.total_from_pension(), 5_000.0);
    }

    #[test]
    fn tax_optimized_couple_stays_inside_allowances() {
        let mut people = vec![retiree("A", 300_000.0, 0.0), retiree("B", 300_000.0, 0.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::TaxOptimized, CrystallisationStrategy::Gradual),
            2026,
            &[0.0, 0.0],
            &table,
        );

        for entry in &breakdown.people {
            assert!(entry.taxable_from_pension <= table.personal_allowance());
            assert_approx_tol(entry.tax_free_from_pension + entry.taxable_from_pension, 10_000.0, 0.05);
        }
        assert_approx_tol(net_received(&breakdown, &[0.0, 0.0], &table), 20_000.0, 0.05);
        assert_approx_tol(people[0].uncrystallised_pot, 290_000.0, 0.05);
        assert_approx_tol(people[1].uncrystallised_pot, 290_000.0, 0.05);
    }

    #[test]
    fn tax_optimized_with_no_need_does_nothing() {
        let mut people = vec![retiree("A", 100_000.0, 10_000.0)];
        let before = people.clone();
        let breakdown = execute_drawdown(
            &mut people,
            0.0,
            &params(DrawdownOrder::TaxOptimized, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &TaxTable::uk_default(),
        );
        assert_eq!(people, before);
        assert_approx(breakdown.total_from_pension(), 0.0);
    }

    #[test]
    fn fill_basic_rate_caps_taxable_and_deposits_excess() {
        let mut people = vec![retiree("A", 1_000_000.0, 0.0)];
        let table = TaxTable::uk_default();
        let state_pension = [10_000.0];
        let breakdown = execute_drawdown(
            &mut people,
            20_000.0,
            &params(DrawdownOrder::FillBasicRate, CrystallisationStrategy::Gradual),
            2026,
            &state_pension,
            &table,
        );

        assert_approx(breakdown.total_taxable(), 50_270.0 - 10_000.0);
        assert_approx(breakdown.people[0].tax_free_from_pension, (50_270.0 - 10_000.0) / 3.0);
        assert_approx(breakdown.total_isa_deposits(), 20_000.0);
        assert_approx(people[0].tax_free_savings, 20_000.0);
    }

    #[test]
    fn fill_basic_rate_banks_the_band_when_nothing_is_needed() {
        let mut people = vec![retiree("A", 500_000.0, 0.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            0.0,
            &params(DrawdownOrder::FillBasicRate, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx_tol(breakdown.total_taxable(), 50_270.0, 1e-4);
        assert_approx(breakdown.total_from_isa(), 0.0);
        assert_approx(breakdown.total_isa_deposits(), 20_000.0);
        assert_approx(people[0].tax_free_savings, 20_000.0);
    }

    #[test]
    fn fill_basic_rate_spills_surplus_to_second_person() {
        let mut people = vec![retiree("A", 1_000_000.0, 0.0), retiree("B", 0.0, 0.0)];
        people[0].isa_annual_limit = 5_000.0;
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            30_000.0,
            &params(DrawdownOrder::FillBasicRate, CrystallisationStrategy::Gradual),
            2026,
            &[0.0, 0.0],
            &table,
        );

        assert_approx(breakdown.people[0].isa_deposit, 5_000.0);
        assert_approx(breakdown.people[1].isa_deposit, 20_000.0);
    }

    #[test]
    fn fill_basic_rate_shortfall_comes_from_savings() {
        let mut people = vec![retiree("A", 10_000.0, 50_000.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            25_000.0,
            &params(DrawdownOrder::FillBasicRate, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(breakdown.total_from_pension(), 10_000.0);
        assert_approx(breakdown.total_from_isa(), 15_000.0);
        assert_approx(breakdown.total_isa_deposits(), 0.0);
    }

    #[test]
    fn pension_to_isa_spreads_surplus_evenly() {
        let mut people = vec![retiree("A", 1_000_000.0, 0.0), retiree("B", 0.0, 0.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            40_000.0,
            &params(DrawdownOrder::PensionToIsa, CrystallisationStrategy::Gradual),
            2026,
            &[0.0, 0.0],
            &table,
        );

        let net = net_from_pension(&breakdown, &[0.0, 0.0], &table);
        let surplus = net - 40_000.0;
        assert!(surplus > 0.0);
        assert_approx(breakdown.people[0].isa_deposit, surplus / 2.0);
        assert_approx(breakdown.people[1].isa_deposit, surplus / 2.0);
    }

    #[test]
    fn pension_to_isa_even_split_overflows_to_headroom() {
        let mut people = vec![retiree("A", 1_000_000.0, 0.0), retiree("B", 0.0, 0.0)];
        people[1].isa_annual_limit = 1_000.0;
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            40_000.0,
            &params(DrawdownOrder::PensionToIsa, CrystallisationStrategy::Gradual),
            2026,
            &[0.0, 0.0],
            &table,
        );

        let surplus = net_from_pension(&breakdown, &[0.0, 0.0], &table) - 40_000.0;
        assert_approx(breakdown.people[1].isa_deposit, 1_000.0);
        assert_approx(breakdown.people[0].isa_deposit, surplus - 1_000.0);
    }

    #[test]
    fn maximize_couple_isa_fills_both_ceilings() {
        let mut people = vec![retiree("A", 1_000_000.0, 0.0), retiree("B", 0.0, 0.0)];
        let table = TaxTable::uk_default();
        let mut policy = params(DrawdownOrder::PensionToIsa, CrystallisationStrategy::Gradual);
        policy.maximize_couple_isa = true;

        let breakdown = execute_drawdown(&mut people, 30_000.0, &policy, 2026, &[0.0, 0.0], &table);

        assert_approx_tol(breakdown.total_isa_deposits(), 40_000.0, 1.0);
        assert!(breakdown.total_taxable() > table.basic_rate_limit());
    }

    #[test]
    fn pension_to_isa_without_need_does_nothing() {
        let mut people = vec![retiree("A", 500_000.0, 0.0)];
        let before = people.clone();
        execute_drawdown(
            &mut people,
            0.0,
            &params(DrawdownOrder::PensionToIsa, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &TaxTable::uk_default(),
        );
        assert_eq!(people, before);
    }

    #[test]
    fn proactive_fills_savings_ceiling_without_need() {
        let mut people = vec![retiree("A", 500_000.0, 0.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            0.0,
            &params(DrawdownOrder::PensionToIsaProactive, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx_tol(breakdown.total_isa_deposits(), 20_000.0, 1.0);
        assert!(breakdown.total_taxable() <= table.basic_rate_limit());
        assert_approx_tol(people[0].tax_free_savings, 20_000.0, 1.0);
    }

    #[test]
    fn proactive_skips_when_no_ceiling_room() {
        let mut people = vec![retiree("A", 500_000.0, 0.0)];
        people[0].isa_annual_limit = 0.0;
        let before = people.clone();
        execute_drawdown(
            &mut people,
            0.0,
            &params(DrawdownOrder::PensionToIsaProactive, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &TaxTable::uk_default(),
        );
        assert_eq!(people, before);
    }

    #[test]
    fn bridge_fills_basic_rate_before_state_pension() {
        let mut people = vec![retiree("A", 1_000_000.0, 0.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            15_000.0,
            &params(DrawdownOrder::StatePensionBridge, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );

        assert_approx(breakdown.total_taxable(), 50_270.0);
        assert!(breakdown.total_isa_deposits() > 0.0);
    }

    #[test]
    fn bridge_draws_only_need_once_state_pension_starts() {
        let mut people = vec![retiree("A", 1_000_000.0, 50_000.0)];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            15_000.0,
            &params(DrawdownOrder::StatePensionBridge, CrystallisationStrategy::Gradual),
            2026,
            &[11_000.0],
            &table,
        );

        assert_approx(breakdown.total_isa_deposits(), 0.0);
        assert_approx(breakdown.total_from_isa(), 0.0);
        assert_approx_tol(net_from_pension(&breakdown, &[11_000.0], &table), 15_000.0, 1.0);
    }

    #[test]
    fn inaccessible_pension_is_left_alone() {
        let mut person = Person::new("Young", 1990, 57);
        person.uncrystallised_pot = 400_000.0;
        person.tax_free_savings = 10_000.0;
        let mut people = vec![person];
        let table = TaxTable::uk_default();
        for order in DrawdownOrder::ALL {
            let mut ledgers = people.clone();
            execute_drawdown(
                &mut ledgers,
                25_000.0,
                &params(order, CrystallisationStrategy::Gradual),
                2026,
                &[0.0],
                &table,
            );
            assert_approx(ledgers[0].uncrystallised_pot, 400_000.0);
        }
        let breakdown = execute_drawdown(
            &mut people,
            25_000.0,
            &params(DrawdownOrder::SavingsFirst, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );
        assert_approx(breakdown.total_from_isa(), 10_000.0);
    }

    #[test]
    fn post_lump_sum_gradual_is_fully_taxable() {
        let mut person = retiree("A", 100_000.0, 0.0);
        person.pcls_taken = true;
        let mut people = vec![person];
        let table = TaxTable::uk_default();
        let breakdown = execute_drawdown(
            &mut people,
            10_000.0,
            &params(DrawdownOrder::PensionFirst, CrystallisationStrategy::Gradual),
            2026,
            &[0.0],
            &table,
        );
        assert_approx(breakdown.people[0].tax_free_from_pension, 0.0);
        assert_approx_tol(breakdown.total_taxable(), 10_000.0, 1.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_every_policy_conserves_money(
            order_index in 0usize..8,
            ufpls in proptest::bool::ANY,
            uncrystallised in 0.0f64..600_000.0,
            crystallised in 0.0f64..100_000.0,
            savings in 0.0f64..80_000.0,
            partner_pot in 0.0f64..300_000.0,
            need in -5_000.0f64..90_000.0,
            state_pension in 0.0f64..12_000.0,
        ) {
            let mut a = retiree("A", uncrystallised, savings);
            a.crystallised_pot = crystallised;
            let b = retiree("B", partner_pot, 0.0);
            let mut people = vec![a, b];
            let before: Vec<Person> = people.clone();
            let strategy = if ufpls {
                CrystallisationStrategy::Ufpls
            } else {
                CrystallisationStrategy::Gradual
            };
            let table = TaxTable::uk_default();

            let breakdown = execute_drawdown(
                &mut people,
                need,
                &params(DrawdownOrder::ALL[order_index], strategy),
                2026,
                &[state_pension, 0.0],
                &table,
            );

            for (person, old) in people.iter().zip(&before) {
                prop_assert!(person.uncrystallised_pot >= 0.0);
                prop_assert!(person.crystallised_pot >= 0.0);
                prop_assert!(person.tax_free_savings >= 0.0);
                prop_assert!(person.uncrystallised_pot <= old.uncrystallised_pot + 1e-6);
                prop_assert!(person.crystallised_pot <= old.crystallised_pot + 1e-6);
            }
            for (entry, person) in breakdown.people.iter().zip(&people) {
                prop_assert!(entry.isa_deposit <= person.isa_annual_limit + 1e-6);
                prop_assert!(entry.tax_free_from_isa >= 0.0);
            }

            let withdrawn = breakdown.total_from_pension() + breakdown.total_from_isa();
            let deposited = breakdown.total_isa_deposits();
            let delta = total_balance(&before) - total_balance(&people);
            prop_assert!((delta - (withdrawn - deposited)).abs() < 1e-4);
        }

        #[test]
        fn prop_need_is_met_when_money_is_ample(
            order_index in 0usize..8,
            need in 1_000.0f64..60_000.0,
            state_pension in 0.0f64..12_000.0,
        ) {
            let order = DrawdownOrder::ALL[order_index];
            let mut people = vec![retiree("A", 2_000_000.0, 200_000.0), retiree("B", 2_000_000.0, 200_000.0)];
            let table = TaxTable::uk_default();
            let state = [state_pension, 0.0];

            let breakdown = execute_drawdown(
                &mut people,
                need,
                &params(order, CrystallisationStrategy::Gradual),
                2026,
                &state,
                &table,
            );

            prop_assert!(net_received(&breakdown, &state, &table) >= need - 2.0);
        }
    }
}
