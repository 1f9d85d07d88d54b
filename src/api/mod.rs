use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::core::{
    AnalysisDepth, CombinationCounts, CrystallisationStrategy, DrawdownOrder, FactorId,
    FactorRegistry, MortgageOption, Person, SimulationParams, WithdrawalBreakdown,
    combination_count, combinations_for_config, execute_drawdown, get_strategies_for_config,
    net_from_pension,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliDepth {
    Quick,
    Standard,
    Thorough,
    Comprehensive,
}

impl From<CliDepth> for AnalysisDepth {
    fn from(value: CliDepth) -> Self {
        match value {
            CliDepth::Quick => AnalysisDepth::Quick,
            CliDepth::Standard => AnalysisDepth::Standard,
            CliDepth::Thorough => AnalysisDepth::Thorough,
            CliDepth::Comprehensive => AnalysisDepth::Comprehensive,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCrystallisation {
    Gradual,
    Ufpls,
}

impl From<CliCrystallisation> for CrystallisationStrategy {
    fn from(value: CliCrystallisation) -> Self {
        match value {
            CliCrystallisation::Gradual => CrystallisationStrategy::Gradual,
            CliCrystallisation::Ufpls => CrystallisationStrategy::Ufpls,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliDrawdownOrder {
    SavingsFirst,
    PensionFirst,
    TaxOptimized,
    PensionOnly,
    PensionToIsa,
    PensionToIsaProactive,
    FillBasicRate,
    StatePensionBridge,
}

impl From<CliDrawdownOrder> for DrawdownOrder {
    fn from(value: CliDrawdownOrder) -> Self {
        match value {
            CliDrawdownOrder::SavingsFirst => DrawdownOrder::SavingsFirst,
            CliDrawdownOrder::PensionFirst => DrawdownOrder::PensionFirst,
            CliDrawdownOrder::TaxOptimized => DrawdownOrder::TaxOptimized,
            CliDrawdownOrder::PensionOnly => DrawdownOrder::PensionOnly,
            CliDrawdownOrder::PensionToIsa => DrawdownOrder::PensionToIsa,
            CliDrawdownOrder::PensionToIsaProactive => DrawdownOrder::PensionToIsaProactive,
            CliDrawdownOrder::FillBasicRate => DrawdownOrder::FillBasicRate,
            CliDrawdownOrder::StatePensionBridge => DrawdownOrder::StatePensionBridge,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "drawdown",
    about = "UK pension drawdown allocator (gradual/UFPLS crystallisation, ISA + pension, tax bands)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the strategy tuples a comparison run would execute.
    Strategies(StrategiesArgs),
    /// Count strategy combinations at every analysis depth.
    Combinations {
        #[arg(long)]
        config: PathBuf,
    },
    /// Allocate a single year's withdrawals.
    Year(YearArgs),
}

#[derive(Args, Debug)]
struct StrategiesArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, value_enum, default_value_t = CliDepth::Standard)]
    depth: CliDepth,
    #[arg(long, help = "Use the fixed strategy list instead of the factor registry")]
    legacy: bool,
}

#[derive(Args, Debug)]
struct YearArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, help = "Simulated calendar year")]
    year: i32,
    #[arg(long, help = "Net income required this year, after tax")]
    net_needed: f64,
    #[arg(long, value_enum, default_value_t = CliCrystallisation::Gradual)]
    crystallisation: CliCrystallisation,
    #[arg(long, value_enum, default_value_t = CliDrawdownOrder::TaxOptimized)]
    order: CliDrawdownOrder,
    #[arg(long)]
    maximize_couple_isa: bool,
    #[arg(long, help = "Apply the configured growth to balances after withdrawing")]
    grow: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StrategyEntry {
    name: String,
    description: String,
    params: SimulationParams,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StrategiesReport {
    depth: Option<AnalysisDepth>,
    count: usize,
    strategies: Vec<StrategyEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CombinationsReport {
    applicable_factors: Vec<FactorId>,
    counts: CombinationCounts,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct YearReport {
    year: i32,
    net_needed: f64,
    params: SimulationParams,
    state_pension: Vec<f64>,
    breakdown: WithdrawalBreakdown,
    net_delivered: f64,
    tax_on_withdrawals: f64,
    people: Vec<Person>,
}

pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let output = execute(cli)?;
    println!("{output}");
    Ok(())
}

fn execute(cli: Cli) -> Result<String, AppError> {
    let json = match cli.command {
        Command::Strategies(args) => {
            let config = Config::load(&args.config)?;
            serde_json::to_string_pretty(&strategies_report(&config, args.depth.into(), args.legacy))?
        }
        Command::Combinations { config } => {
            let config = Config::load(&config)?;
            serde_json::to_string_pretty(&combinations_report(&config))?
        }
        Command::Year(args) => {
            let config = Config::load(&args.config)?;
            let params = build_year_params(&args, &config).map_err(AppError::Usage)?;
            serde_json::to_string_pretty(&year_report(&config, &args, params))?
        }
    };
    Ok(json)
}

fn strategies_report(config: &Config, depth: AnalysisDepth, legacy: bool) -> StrategiesReport {
    let strategies: Vec<StrategyEntry> = if legacy {
        get_strategies_for_config(config)
            .into_iter()
            .map(|params| StrategyEntry {
                name: params.short_name(),
                description: params.description(config.mortgage.payoff_year(params.mortgage)),
                params,
            })
            .collect()
    } else {
        combinations_for_config(config, depth)
            .iter()
            .map(|combo| StrategyEntry {
                name: combo.short_name(),
                description: combo.display_name(),
                params: combo.to_simulation_params(),
            })
            .collect()
    };

    info!("{} strategies for {} people", strategies.len(), config.people.len());
    StrategiesReport {
        depth: (!legacy).then_some(depth),
        count: strategies.len(),
        strategies,
    }
}

fn combinations_report(config: &Config) -> CombinationsReport {
    CombinationsReport {
        applicable_factors: FactorRegistry::global()
            .applicable_factors(config)
            .iter()
            .map(|f| f.id)
            .collect(),
        counts: combination_count(config),
    }
}

fn build_year_params(args: &YearArgs, config: &Config) -> Result<SimulationParams, String> {
    if config.people.is_empty() {
        return Err("--config must describe at least one person".to_string());
    }

    if args.year < config.simulation.start_year {
        return Err(format!(
            "--year must be >= simulation start year {}",
            config.simulation.start_year
        ));
    }

    if !args.net_needed.is_finite() {
        return Err("--net-needed must be a finite amount".to_string());
    }

    if args.maximize_couple_isa && !config.is_couple() {
        return Err("--maximize-couple-isa needs two people in --config".to_string());
    }

    let mut params = SimulationParams::new(
        args.crystallisation.into(),
        args.order.into(),
        MortgageOption::Normal,
    );
    params.maximize_couple_isa = args.maximize_couple_isa;
    Ok(params)
}

fn year_report(config: &Config, args: &YearArgs, params: SimulationParams) -> YearReport {
    let mut people = config.build_people();
    let state_pension = config.state_pension_for_year(args.year);
    let table = config.tax_table_for_year(args.year);

    let breakdown = execute_drawdown(
        &mut people,
        args.net_needed,
        &params,
        args.year,
        &state_pension,
        &table,
    );

    let tax_on_withdrawals: f64 = breakdown
        .people
        .iter()
        .zip(&state_pension)
        .map(|(p, &sp)| table.marginal_tax(p.taxable_from_pension, sp))
        .sum();
    let net_delivered = breakdown.total_from_isa() + net_from_pension(&breakdown, &state_pension, &table)
        - breakdown.total_isa_deposits();

    if args.grow {
        for person in &mut people {
            if let Some(age) = person.age_in(args.year) {
                config.simulation.growth.apply(person, age);
            }
        }
    }

    YearReport {
        year: args.year,
        net_needed: args.net_needed,
        params,
        state_pension,
        breakdown,
        net_delivered,
        tax_on_withdrawals,
        people,
    }
}
