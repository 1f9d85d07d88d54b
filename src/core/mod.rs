mod crystallisation;
mod engine;
mod factors;
mod optimizer;
mod solver;
mod tax;
mod types;

pub use crystallisation::{
    CrystallisationResult, GrowthPath, apply_growth, deposit_to_isa, gradual_crystallise,
    take_full_lump_sum, ufpls_withdraw, withdraw_from_crystallised, withdraw_from_isa,
};
pub use engine::{execute_drawdown, net_from_pension};
pub use factors::{
    AnalysisDepth, CombinationCounts, Constraint, Factor, FactorId, FactorRegistry, FactorSetting,
    FactorValue, StrategyCombo, combination_count, combinations_for_config, default_constraints,
    generate_combinations, get_strategies_for_config, get_strategies_for_config_v2,
    pension_only_strategies, pension_to_isa_strategies, satisfies_all,
};
pub use optimizer::{
    OptimizedWithdrawalPlan, PersonTaxState, PlannedWithdrawal, calculate_optimized_withdrawals,
};
pub use solver::{
    GrossUpSolution, net_yield, solve_split_gross, solve_split_gross_bisection,
    solve_taxable_gross,
};
pub use tax::{AllowanceTaper, TaxBand, TaxTable, uk_default_bands};
pub use types::{
    CrystallisationStrategy, DrawdownOrder, MortgageOption, PENSION_TAX_FREE_FRACTION, Person,
    PersonWithdrawal, SimulationParams, WithdrawalBreakdown,
};
