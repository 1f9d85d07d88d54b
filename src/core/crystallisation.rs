use serde::{Deserialize, Serialize};

use super::types::{CrystallisationStrategy, PENSION_TAX_FREE_FRACTION, Person};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrystallisationResult {
    pub amount_crystallised: f64,
    pub tax_free_portion: f64,
    pub taxable_portion: f64,
}

impl CrystallisationResult {
    pub fn total(&self) -> f64 {
        self.tax_free_portion + self.taxable_portion
    }
}

impl CrystallisationStrategy {
    /// Draws up to `amount` out of the uncrystallised pot under this strategy.
    pub fn crystallise(self, person: &mut Person, amount: f64) -> CrystallisationResult {
        match self {
            CrystallisationStrategy::Gradual => gradual_crystallise(person, amount),
            CrystallisationStrategy::Ufpls => ufpls_withdraw(person, amount),
        }
    }
}

/// Crystallises the whole uncrystallised pot at once. The tax-free quarter
/// moves into tax-free savings and the rest lands in the crystallised pot; the
/// lump-sum flag never resets.
pub fn take_full_lump_sum(person: &mut Person) -> CrystallisationResult {
    if person.pcls_taken || person.uncrystallised_pot <= 0.0 {
        return CrystallisationResult::default();
    }

    let amount = person.uncrystallised_pot;
    let tax_free = amount * PENSION_TAX_FREE_FRACTION;
    let taxable = amount - tax_free;

    person.uncrystallised_pot = 0.0;
    person.tax_free_savings += tax_free;
    person.crystallised_pot += taxable;
    person.pcls_taken = true;

    CrystallisationResult {
        amount_crystallised: amount,
        tax_free_portion: tax_free,
        taxable_portion: taxable,
    }
}

/// Crystallises `amount` (capped at the pot) and pays both portions out in
/// the same step. After a full lump sum the whole amount is taxable.
pub fn gradual_crystallise(person: &mut Person, amount: f64) -> CrystallisationResult {
    if amount <= 0.0 || person.uncrystallised_pot <= 0.0 {
        return CrystallisationResult::default();
    }

    let crystallised = person.uncrystallised_pot.min(amount);
    let fraction = CrystallisationStrategy::Gradual.tax_free_fraction(person.pcls_taken);
    let tax_free = crystallised * fraction;

    person.uncrystallised_pot = (person.uncrystallised_pot - crystallised).max(0.0);

    CrystallisationResult {
        amount_crystallised: crystallised,
        tax_free_portion: tax_free,
        taxable_portion: crystallised - tax_free,
    }
}

/// Uncrystallised funds pension lump sum. Always a 25/75 split, and what is
/// left keeps its full tax-free entitlement.
pub fn ufpls_withdraw(person: &mut Person, amount: f64) -> CrystallisationResult {
    if amount <= 0.0 || person.uncrystallised_pot <= 0.0 {
        return CrystallisationResult::default();
    }

    let withdrawn = person.uncrystallised_pot.min(amount);
    let tax_free = withdrawn * PENSION_TAX_FREE_FRACTION;

    person.uncrystallised_pot = (person.uncrystallised_pot - withdrawn).max(0.0);

    CrystallisationResult {
        amount_crystallised: withdrawn,
        tax_free_portion: tax_free,
        taxable_portion: withdrawn - tax_free,
    }
}

/// Withdraws from tax-free savings without dipping below the preserved
/// minimum. Returns the amount actually taken.
pub fn withdraw_from_isa(person: &mut Person, amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    let taken = amount.min(person.available_isa());
    person.tax_free_savings -= taken;
    taken
}

/// Withdraws fully taxable money from the crystallised pot.
pub fn withdraw_from_crystallised(person: &mut Person, amount: f64) -> f64 {
    if amount <= 0.0 || person.crystallised_pot <= 0.0 {
        return 0.0;
    }
    let taken = amount.min(person.crystallised_pot);
    person.crystallised_pot = (person.crystallised_pot - taken).max(0.0);
    taken
}

pub fn deposit_to_isa(person: &mut Person, amount: f64) {
    if amount > 0.0 {
        person.tax_free_savings += amount;
    }
}

pub fn apply_growth(person: &mut Person, savings_rate: f64, pension_rate: f64) {
    person.tax_free_savings *= 1.0 + savings_rate;
    person.uncrystallised_pot *= 1.0 + pension_rate;
    person.crystallised_pot *= 1.0 + pension_rate;
}

/// Deterministic growth rates with an optional pension glide path: the
/// pension rate moves linearly from `pension_start_rate` to
/// `pension_end_rate` between the two ages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrowthPath {
    pub savings_rate: f64,
    pub pension_start_rate: f64,
    pub pension_end_rate: f64,
    pub decline_start_age: u32,
    pub decline_target_age: u32,
}

impl Default for GrowthPath {
    fn default() -> Self {
        Self {
            savings_rate: 0.05,
            pension_start_rate: 0.05,
            pension_end_rate: 0.05,
            decline_start_age: 0,
            decline_target_age: 0,
        }
    }
}

impl GrowthPath {
    pub fn constant(rate: f64) -> Self {
        Self {
            savings_rate: rate,
            pension_start_rate: rate,
            pension_end_rate: rate,
            ..Self::default()
        }
    }

    pub fn pension_rate_for_age(&self, age: u32) -> f64 {
        if self.decline_target_age <= self.decline_start_age || age <= self.decline_start_age {
            return self.pension_start_rate;
        }
        if age >= self.decline_target_age {
            return self.pension_end_rate;
        }
        let span = f64::from(self.decline_target_age - self.decline_start_age);
        let progress = f64::from(age - self.decline_start_age) / span;
        self.pension_start_rate + (self.pension_end_rate - self.pension_start_rate) * progress
    }

    pub fn apply(&self, person: &mut Person, age: u32) {
        apply_growth(person, self.savings_rate, self.pension_rate_for_age(age));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn person_with_pot(pot: f64) -> Person {
        let mut person = Person::new("Alice", 1965, 55);
        person.uncrystallised_pot = pot;
        person
    }

    #[test]
    fn full_lump_sum_splits_whole_pot() {
        let mut person = person_with_pot(100_000.0);
        let result = take_full_lump_sum(&mut person);

        assert_approx(result.tax_free_portion, 25_000.0);
        assert_approx(result.taxable_portion, 75_000.0);
        assert_approx(person.uncrystallised_pot, 0.0);
        assert_approx(person.crystallised_pot, 75_000.0);
        assert_approx(person.tax_free_savings, 25_000.0);
        assert!(person.pcls_taken);
    }

    #[test]
    fn full_lump_sum_keeps_total_wealth() {
        let mut person = person_with_pot(100_000.0);
        person.tax_free_savings = 5_000.0;
        person.crystallised_pot = 2_000.0;
        let before = person.total_wealth();

        take_full_lump_sum(&mut person);

        assert_approx(person.total_wealth(), before);
        assert_approx(person.tax_free_savings, 30_000.0);
    }

    #[test]
    fn full_lump_sum_only_happens_once() {
        let mut person = person_with_pot(100_000.0);
        take_full_lump_sum(&mut person);
        person.uncrystallised_pot = 10_000.0;

        let again = take_full_lump_sum(&mut person);
        assert_eq!(again, CrystallisationResult::default());
        assert_approx(person.uncrystallised_pot, 10_000.0);
    }

    #[test]
    fn gradual_crystallisation_twice_tracks_remaining_pot() {
        let mut person = person_with_pot(100_000.0);

        let first = gradual_crystallise(&mut person, 20_000.0);
        assert_approx(person.uncrystallised_pot, 80_000.0);
        assert_approx(first.tax_free_portion, 5_000.0);
        assert_approx(first.taxable_portion, 15_000.0);

        let second = gradual_crystallise(&mut person, 20_000.0);
        assert_approx(person.uncrystallised_pot, 60_000.0);
        assert_approx(first.tax_free_portion + second.tax_free_portion, 10_000.0);
    }

    #[test]
    fn gradual_after_lump_sum_is_fully_taxable() {
        let mut person = person_with_pot(50_000.0);
        person.pcls_taken = true;

        let result = gradual_crystallise(&mut person, 10_000.0);
        assert_approx(result.tax_free_portion, 0.0);
        assert_approx(result.taxable_portion, 10_000.0);
    }

    #[test]
    fn ufpls_keeps_split_regardless_of_lump_sum_flag() {
        let mut person = person_with_pot(100_000.0);
        let result = ufpls_withdraw(&mut person, 40_000.0);
        assert_approx(result.tax_free_portion, 10_000.0);
        assert_approx(result.taxable_portion, 30_000.0);
        assert_approx(person.uncrystallised_pot, 60_000.0);
        assert_approx(person.crystallised_pot, 0.0);

        person.pcls_taken = true;
        let later = ufpls_withdraw(&mut person, 10_000.0);
        assert_approx(later.tax_free_portion, 2_500.0);
    }

    #[test]
    fn non_positive_requests_have_no_effect() {
        let mut person = person_with_pot(10_000.0);
        person.tax_free_savings = 5_000.0;
        person.crystallised_pot = 1_000.0;
        let before = person.clone();

        assert_eq!(gradual_crystallise(&mut person, 0.0), CrystallisationResult::default());
        assert_eq!(ufpls_withdraw(&mut person, -5.0), CrystallisationResult::default());
        assert_approx(withdraw_from_isa(&mut person, -1.0), 0.0);
        assert_approx(withdraw_from_crystallised(&mut person, 0.0), 0.0);
        assert_eq!(person, before);

        let mut empty = person_with_pot(0.0);
        assert_eq!(take_full_lump_sum(&mut empty), CrystallisationResult::default());
        assert!(!empty.pcls_taken);
    }

    #[test]
    fn isa_withdrawal_respects_minimum() {
        let mut person = person_with_pot(0.0);
        person.tax_free_savings = 30_000.0;
        person.isa_minimum = 25_000.0;

        assert_approx(withdraw_from_isa(&mut person, 10_000.0), 5_000.0);
        assert_approx(person.tax_free_savings, 25_000.0);
    }

    #[test]
    fn crystallised_withdrawal_caps_at_pot() {
        let mut person = person_with_pot(0.0);
        person.crystallised_pot = 3_000.0;
        assert_approx(withdraw_from_crystallised(&mut person, 5_000.0), 3_000.0);
        assert_approx(person.crystallised_pot, 0.0);
    }

    #[test]
    fn growth_applies_to_each_bucket() {
        let mut person = person_with_pot(100_000.0);
        person.crystallised_pot = 50_000.0;
        person.tax_free_savings = 10_000.0;
        apply_growth(&mut person, 0.02, 0.05);
        assert_approx(person.uncrystallised_pot, 105_000.0);
        assert_approx(person.crystallised_pot, 52_500.0);
        assert_approx(person.tax_free_savings, 10_200.0);
    }

    #[test]
    fn glide_path_interpolates_and_clamps() {
        let path = GrowthPath {
            savings_rate: 0.04,
            pension_start_rate: 0.06,
            pension_end_rate: 0.02,
            decline_start_age: 60,
            decline_target_age: 70,
        };
        assert_approx(path.pension_rate_for_age(55), 0.06);
        assert_approx(path.pension_rate_for_age(65), 0.04);
        assert_approx(path.pension_rate_for_age(75), 0.02);

        let flat = GrowthPath::constant(0.03);
        assert_approx(flat.pension_rate_for_age(90), 0.03);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_crystallisation_conserves_money(
            pot in 0.0f64..1_000_000.0,
            amount in 0.0f64..1_500_000.0,
            ufpls in proptest::bool::ANY,
            pcls_taken in proptest::bool::ANY,
        ) {
            let mut person = person_with_pot(pot);
            person.pcls_taken = pcls_taken;
            let strategy = if ufpls {
                CrystallisationStrategy::Ufpls
            } else {
                CrystallisationStrategy::Gradual
            };

            let result = strategy.crystallise(&mut person, amount);
            prop_assert!((result.total() - result.amount_crystallised).abs() < 1e-6);
            prop_assert!((person.uncrystallised_pot + result.amount_crystallised - pot).abs() < 1e-6);
            prop_assert!(person.uncrystallised_pot >= 0.0);
            prop_assert!(result.amount_crystallised <= pot + 1e-9);

            let expected_fraction = strategy.tax_free_fraction(pcls_taken);
            prop_assert!(
                (result.tax_free_portion - result.amount_crystallised * expected_fraction).abs() < 1e-6
            );
        }

        #[test]
        fn prop_withdrawals_never_increase_or_overdraw(
            savings in 0.0f64..200_000.0,
            minimum in 0.0f64..50_000.0,
            crystallised in 0.0f64..200_000.0,
            amount in -1_000.0f64..300_000.0,
        ) {
            let mut person = person_with_pot(0.0);
            person.tax_free_savings = savings;
            person.isa_minimum = minimum;
            person.crystallised_pot = crystallised;

            let from_isa = withdraw_from_isa(&mut person, amount);
            let from_pot = withdraw_from_crystallised(&mut person, amount);

            prop_assert!(from_isa >= 0.0 && from_pot >= 0.0);
            prop_assert!(person.tax_free_savings <= savings);
            prop_assert!(person.crystallised_pot >= 0.0);
            prop_assert!(person.tax_free_savings >= savings.min(minimum) - 1e-9);
            prop_assert!((person.crystallised_pot + from_pot - crystallised).abs() < 1e-6);
        }
    }
}
