//! mri-pipe - Bruker MRI pipeline planner
//!
//! Catalogs Bruker measurement trees, assembles processing workflows and
//! writes the execution plans (`graph.json`, `plan.json`, `graph.dot`) the
//! external engine runs. Also hosts the custom node commands the plans
//! invoke (`scan-info`, `resize-voxels`) and lists BIDS inputs
//! (`bids-sources`).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mri_common::bids::{PipelineDirs, SourceGrouping};
use mri_common::config::{expand_home, load_config, resolve_measurements_root, LoggingConfig, TomlConfig};
use mri_pipe::bids_find::{find_level1_copes, list_sources, SourceQuery};
use mri_pipe::bruker::read_scan_metadata;
use mri_pipe::catalog::{DroppedMeasurement, ScanCatalog, ScanClassification, ScanRecord};
use mri_pipe::execution::{ExecutionConfig, ExecutionSettings};
use mri_pipe::pipelines::diagnostic::{self, build_diagnostic, detect_root, DiagnosticOptions};
use mri_pipe::pipelines::level1::{build_level1, Level1Options, DEFAULT_LEVEL1_NAME};
use mri_pipe::pipelines::level2::{
    aggregate, bids_groups, build_level2, AggregationRequest, GroupBy, GroupOutcome, GroupResolver, Grouping,
    Level2Options, DEFAULT_LEVEL2_NAME,
};
use mri_pipe::pipelines::preprocessing::{build_preprocessing, PreprocessingOptions, Smoothing};
use mri_pipe::pipelines::{DataSelection, ScanTypeRequest, StructuralScans};
use mri_pipe::resolver::TieBreak;
use mri_pipe::selection::SelectionCriteria;
use mri_pipe::voxel_resize::{resize_voxels, DEFAULT_RESIZE_FACTORS};
use mri_pipe::workflow::{write_plan, SourceResolver, Workflow};

/// Command-line arguments for mri-pipe
#[derive(Parser, Debug)]
#[command(name = "mri-pipe")]
#[command(about = "Bruker MRI pipeline planner")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "MRI_PIPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lite preprocessing plus MELODIC reports for quick inspection
    Diagnose {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        plan: PlanArgs,
        /// Add a realignment step
        #[arg(long)]
        realign: bool,
        /// Repetition time in seconds
        #[arg(long, default_value_t = 1.0)]
        tr: f64,
    },
    /// Print the scan catalog of a measurements root as JSON
    Catalog {
        /// Measurements root
        measurements_root: Option<PathBuf>,
        /// Scan type classification CSV
        #[arg(long)]
        classification: Option<PathBuf>,
    },
    /// Plan the preprocessing pipeline
    Preprocess {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        plan: PlanArgs,
        #[command(flatten)]
        registration: RegistrationArgs,
        /// Conversion and optional realignment only
        #[arg(long)]
        lite: bool,
        /// Realign in the lite variant
        #[arg(long, requires = "lite")]
        realign: bool,
    },
    /// Plan the first-level GLM pipeline
    Level1 {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        plan: PlanArgs,
        #[command(flatten)]
        registration: RegistrationArgs,
        /// Pipeline name
        #[arg(long, default_value = DEFAULT_LEVEL1_NAME)]
        name: String,
    },
    /// Plan the second-level (group) analysis
    Level2 {
        /// First-level pipeline directory
        level1_dir: PathBuf,
        /// Categories merged into one group
        #[arg(long, value_delimiter = ',', conflicts_with_all = ["category_groups", "bids_groupby"])]
        categories: Vec<String>,
        /// One merge group per flag, comma separated categories
        #[arg(long = "category-group")]
        category_groups: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,
        #[arg(long = "scan-types", value_delimiter = ',', conflicts_with = "scan_type_groups")]
        scan_types: Vec<String>,
        /// One merge group per flag, comma separated scan types
        #[arg(long = "scan-type-group")]
        scan_type_groups: Vec<String>,
        /// Read a BIDS-layout level-1 tree grouped by subject, session or scan
        #[arg(long = "bids-groupby")]
        bids_groupby: Option<String>,
        /// Subjects left out of BIDS groups
        #[arg(long, value_delimiter = ',', requires = "bids_groupby")]
        exclude_subjects: Vec<String>,
        /// Brain mask in template space
        #[arg(long)]
        mask: Option<PathBuf>,
        /// Pipeline name
        #[arg(long, default_value = DEFAULT_LEVEL2_NAME)]
        name: String,
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Multiply voxel sizes in NIfTI headers
    ResizeVoxels {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Per-axis factors
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_RESIZE_FACTORS)]
        factors: Vec<f32>,
    },
    /// Print scan type and timing of a scan directory as JSON
    ScanInfo { scan_dir: PathBuf },
    /// Print BIDS input files as JSON: path template, substitutions, sources
    BidsSources {
        /// BIDS directory searched for `--modality` files
        #[arg(long, required_unless_present = "template", conflicts_with = "template")]
        bids_dir: Option<PathBuf>,
        /// func or anat
        #[arg(long, default_value = "func")]
        modality: String,
        /// Template with `{data_dir}`, `{preprocessing_dir}`, `{subject}`, `{session}`, `{trial}`, … fields
        #[arg(long, requires_all = ["subjects", "sessions", "trials"])]
        template: Option<String>,
        /// Value of `{data_dir}` (default: config `workflow_base`, then the current directory)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, default_value = "preprocessing")]
        preprocessing_dir: String,
        #[arg(long)]
        preprocessing_workdir: Option<String>,
        #[arg(long)]
        l1_dir: Option<String>,
        #[arg(long)]
        l1_workdir: Option<String>,
        #[arg(long, value_delimiter = ',')]
        subjects: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        sessions: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        trials: Vec<String>,
        /// individual (one file per tuple) or session (one glob per session)
        #[arg(long, default_value = "individual")]
        group_by: String,
    },
}

/// Which scans to plan for
#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    /// Measurements root (diagnose also accepts a single measurement directory)
    measurements_root: Option<PathBuf>,
    /// Empty: every scan type classified as functional
    #[arg(long = "functional-scan-types", value_delimiter = ',')]
    functional_scan_types: Vec<String>,
    /// Empty: every scan type classified as structural
    #[arg(long = "structural-scan-type", value_delimiter = ',')]
    structural_scan_types: Vec<String>,
    /// Skip the structural branch
    #[arg(long, conflicts_with = "structural_scan_types")]
    no_structural: bool,
    #[arg(long, value_delimiter = ',')]
    conditions: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    subjects: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    exclude_subjects: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    measurements: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    exclude_measurements: Vec<String>,
    /// Scan type classification CSV
    #[arg(long)]
    classification: Option<PathBuf>,
}

impl SelectionArgs {
    fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria::new()
            .conditions(self.conditions.iter().cloned())
            .subjects(self.subjects.iter().cloned())
            .exclude_subjects(self.exclude_subjects.iter().cloned())
            .measurements(self.measurements.iter().cloned())
            .exclude_measurements(self.exclude_measurements.iter().cloned())
    }

    fn scan_types(&self) -> ScanTypeRequest {
        let structural = if self.no_structural {
            StructuralScans::Disabled
        } else {
            StructuralScans::Types(self.structural_scan_types.clone())
        };
        ScanTypeRequest {
            functional: self.functional_scan_types.clone(),
            structural,
        }
    }
}

/// Where and how plans are written
#[derive(Args, Debug, Clone)]
struct PlanArgs {
    /// Engine working directory (default: config, then the measurements root)
    #[arg(long)]
    workflow_base: Option<PathBuf>,
    #[arg(long)]
    n_procs: Option<usize>,
    /// Write the plan and exit successfully despite failed branches
    #[arg(long)]
    keep_going: bool,
    /// Fail tuples matching several scans instead of taking the first
    #[arg(long)]
    strict: bool,
}

/// Template registration settings
#[derive(Args, Debug, Clone)]
struct RegistrationArgs {
    /// Registration template (default: config `template`)
    #[arg(long)]
    template: Option<PathBuf>,
    /// In-plane smoothing FWHM after registration
    #[arg(long)]
    blur_fwhm: Option<f64>,
    /// Repetition time in seconds
    #[arg(long, default_value_t = 1.0)]
    tr: f64,
    /// Keep the acquired voxel size
    #[arg(long)]
    actual_size: bool,
}

impl RegistrationArgs {
    fn smoothing(&self) -> Smoothing {
        match self.blur_fwhm {
            Some(fwhm) => Smoothing::BlurXy { fwhm },
            None => Smoothing::None,
        }
    }

    fn template(&self, config: &TomlConfig) -> Result<PathBuf> {
        self.template
            .as_deref()
            .or(config.template.as_deref())
            .map(expand_home)
            .context("No registration template given (--template or config `template`)")
    }
}

#[derive(Serialize)]
struct CatalogReport<'a> {
    root: &'a Path,
    records: &'a [ScanRecord],
    dropped: &'a [DroppedMeasurement],
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!(
        "Starting mri-pipe v{} [{}] built {}",
        env!("CARGO_PKG_VERSION"),
        env!("MRI_PIPE_COMMIT"),
        env!("MRI_PIPE_BUILD_DATE")
    );

    match cli.command {
        Command::Diagnose {
            selection,
            plan,
            realign,
            tr,
        } => {
            let settings = execution_settings(&plan, &config)?;
            let tie_break = settings.tie_break;
            let root = resolve_measurements_root(selection.measurements_root.as_deref(), &config);
            let detected = detect_root(&root);
            let mut criteria = selection.criteria();
            if let Some(measurement) = detected.measurement {
                if !criteria.measurements.contains(&measurement) {
                    criteria.measurements.push(measurement);
                }
            }

            let data = prepare_data(&detected.root, &selection, criteria, &config)?;
            let execution = execution_config(settings, &plan, &config, &detected.root);
            let options = DiagnosticOptions { realign, tr };
            let (workflow, _) =
                build_diagnostic(&data, &options, &execution).context("Failed to assemble diagnostic workflow")?;

            let resolver = data.resolver(tie_break);
            plan_and_write(&workflow, &resolver, &execution, &diagnostic::plan_dir(&execution), plan.keep_going)
        }
        Command::Catalog {
            measurements_root,
            classification,
        } => {
            let root = resolve_measurements_root(measurements_root.as_deref(), &config);
            let classification = load_classification(classification.as_deref(), &config)?;
            let catalog = ScanCatalog::build(&root, &classification)
                .with_context(|| format!("Failed to catalog {}", root.display()))?;

            let report = CatalogReport {
                root: catalog.root(),
                records: catalog.records(),
                dropped: catalog.dropped(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Preprocess {
            selection,
            plan,
            registration,
            lite,
            realign,
        } => {
            let settings = execution_settings(&plan, &config)?;
            let tie_break = settings.tie_break;
            let root = resolve_measurements_root(selection.measurements_root.as_deref(), &config);
            let data = prepare_data(&root, &selection, selection.criteria(), &config)?;
            let execution = execution_config(settings, &plan, &config, &root);

            let variant = if lite {
                PreprocessingOptions::lite(realign)
            } else {
                PreprocessingOptions::registration(registration.template(&config)?, registration.smoothing())
            };
            let options = variant
                .with_tr(registration.tr)
                .with_actual_size(registration.actual_size);

            let (workflow, _) = build_preprocessing(&data, &options, &execution)
                .context("Failed to assemble preprocessing workflow")?;
            let plan_dir = work_dir(&execution, workflow.name());
            let resolver = data.resolver(tie_break);
            plan_and_write(&workflow, &resolver, &execution, &plan_dir, plan.keep_going)
        }
        Command::Level1 {
            selection,
            plan,
            registration,
            name,
        } => {
            let settings = execution_settings(&plan, &config)?;
            let tie_break = settings.tie_break;
            let root = resolve_measurements_root(selection.measurements_root.as_deref(), &config);
            let data = prepare_data(&root, &selection, selection.criteria(), &config)?;
            let execution = execution_config(settings, &plan, &config, &root);

            let mut options = Level1Options::new(registration.template(&config)?);
            options.name = name;
            options.smoothing = registration.smoothing();
            options.tr = registration.tr;
            options.actual_size = registration.actual_size;

            let (workflow, _) =
                build_level1(&data, &options, &execution).context("Failed to assemble first-level workflow")?;
            let plan_dir = work_dir(&execution, workflow.name());
            let resolver = data.resolver(tie_break);
            plan_and_write(&workflow, &resolver, &execution, &plan_dir, plan.keep_going)
        }
        Command::Level2 {
            level1_dir,
            categories,
            category_groups,
            participants,
            scan_types,
            scan_type_groups,
            bids_groupby,
            exclude_subjects,
            mask,
            name,
            plan,
        } => {
            let settings = execution_settings(&plan, &config)?;
            let level1_dir = expand_home(&level1_dir);
            let mask = mask
                .as_deref()
                .or(config.mask.as_deref())
                .map(expand_home)
                .context("No brain mask given (--mask or config `mask`)")?;

            let outcomes: Vec<GroupOutcome> = match bids_groupby {
                Some(group_by) => {
                    let group_by: GroupBy = group_by.parse()?;
                    let copes = find_level1_copes(&level1_dir)
                        .with_context(|| format!("Failed to search {}", level1_dir.display()))?;
                    bids_groups(&copes, group_by, &exclude_subjects)
                }
                None => {
                    let request = AggregationRequest {
                        level1_dir: level1_dir.clone(),
                        categories: grouping(categories, category_groups),
                        participants,
                        scan_types: grouping(scan_types, scan_type_groups),
                    };
                    aggregate(&request).context("Failed to collect first-level results")?
                }
            };

            let base = level1_dir.parent().unwrap_or(&level1_dir).to_path_buf();
            let execution = execution_config(settings, &plan, &config, &base);
            let plan_dir = work_dir(&execution, &name);

            for outcome in &outcomes {
                if let Ok(inputs) = &outcome.result {
                    inputs
                        .design
                        .write(&plan_dir.join("designs").join(&outcome.key))
                        .with_context(|| format!("Failed to write design of group {}", outcome.key))?;
                }
            }

            let keys: Vec<String> = outcomes.iter().map(|o| o.key.clone()).collect();
            let options = Level2Options { name, mask };
            let workflow =
                build_level2(&keys, &options, &execution).context("Failed to assemble second-level workflow")?;
            let resolver = GroupResolver::new(&outcomes);
            plan_and_write(&workflow, &resolver, &execution, &plan_dir, plan.keep_going)
        }
        Command::ResizeVoxels {
            inputs,
            output_dir,
            factors,
        } => {
            let Ok(factors) = <[f32; 3]>::try_from(factors.as_slice()) else {
                bail!("Exactly three resize factors are required, got {}", factors.len());
            };
            for input in &inputs {
                let output = resize_voxels(input, &output_dir, factors)
                    .with_context(|| format!("Failed to resize {}", input.display()))?;
                println!("{}", output.display());
            }
            Ok(())
        }
        Command::BidsSources {
            bids_dir,
            modality,
            template,
            data_dir,
            preprocessing_dir,
            preprocessing_workdir,
            l1_dir,
            l1_workdir,
            subjects,
            sessions,
            trials,
            group_by,
        } => {
            let grouping: SourceGrouping = group_by.parse()?;
            let query = match (template, bids_dir) {
                (Some(path_template), _) => {
                    let data_dir = match data_dir.as_deref().or(config.workflow_base.as_deref()) {
                        Some(dir) => expand_home(dir),
                        None => std::env::current_dir().context("Failed to read the current directory")?,
                    };
                    SourceQuery::Combinations {
                        path_template,
                        data_dir: data_dir.to_string_lossy().into_owned(),
                        preprocessing_dir,
                        dirs: PipelineDirs {
                            l1_dir,
                            l1_workdir,
                            preprocessing_workdir,
                        },
                        subjects,
                        sessions,
                        trials,
                    }
                }
                (None, Some(bids_dir)) => SourceQuery::Autofind {
                    bids_dir: expand_home(&bids_dir),
                    modality,
                },
                (None, None) => bail!("Either --bids-dir or --template is required"),
            };

            let listing = list_sources(&query, grouping).context("Failed to list BIDS sources")?;
            info!(
                substitutions = listing.substitutions.len(),
                sources = listing.sources.len(),
                "BIDS sources listed"
            );
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        Command::ScanInfo { scan_dir } => {
            let metadata = read_scan_metadata(&scan_dir)
                .with_context(|| format!("Failed to read scan metadata from {}", scan_dir.display()))?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
    }
}

/// Install the fmt subscriber; `RUST_LOG` overrides the configured level
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("Invalid log level '{}'", logging.level))?,
    };

    match &logging.file {
        Some(path) => {
            let path = expand_home(path);
            let file = File::options()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn load_classification(cli_arg: Option<&Path>, config: &TomlConfig) -> Result<ScanClassification> {
    match cli_arg.or(config.scan_classification.as_deref()).map(expand_home) {
        Some(path) => ScanClassification::from_path(&path)
            .with_context(|| format!("Failed to read scan classification {}", path.display())),
        None => {
            warn!("No scan classification table, scan types must be given explicitly");
            Ok(ScanClassification::default())
        }
    }
}

fn prepare_data(
    root: &Path,
    selection: &SelectionArgs,
    criteria: SelectionCriteria,
    config: &TomlConfig,
) -> Result<DataSelection> {
    let classification = load_classification(selection.classification.as_deref(), config)?;
    let catalog = ScanCatalog::build(root, &classification)
        .with_context(|| format!("Failed to catalog {}", root.display()))?;
    let data = DataSelection::prepare(catalog, criteria, &selection.scan_types(), &classification)
        .context("Failed to prepare data selection")?;
    Ok(data)
}

/// Config `[execution]` table with command-line overrides, checked before
/// any directory is read
fn execution_settings(plan: &PlanArgs, config: &TomlConfig) -> Result<ExecutionSettings> {
    let mut settings =
        ExecutionSettings::from_section(&config.execution).context("Invalid [execution] configuration")?;
    if let Some(n_procs) = plan.n_procs {
        settings = settings.with_n_procs(n_procs)?;
    }
    if plan.strict {
        settings.tie_break = TieBreak::RejectAmbiguous;
    }
    Ok(settings)
}

fn execution_config(
    settings: ExecutionSettings,
    plan: &PlanArgs,
    config: &TomlConfig,
    default_base: &Path,
) -> ExecutionConfig {
    let base_dir = plan
        .workflow_base
        .as_deref()
        .or(config.workflow_base.as_deref())
        .map(expand_home)
        .unwrap_or_else(|| default_base.to_path_buf());

    let execution = settings.into_config(base_dir);
    info!(
        plugin = %execution.plugin,
        n_procs = execution.n_procs,
        base_dir = %execution.base_dir.display(),
        "Execution configured"
    );
    execution
}

fn grouping(flat: Vec<String>, groups: Vec<String>) -> Grouping {
    if groups.is_empty() {
        Grouping::Flat(flat)
    } else {
        Grouping::Nested(
            groups
                .iter()
                .map(|group| group.split(',').map(|v| v.trim().to_string()).collect())
                .collect(),
        )
    }
}

fn work_dir(execution: &ExecutionConfig, name: &str) -> PathBuf {
    execution.base_dir.join(format!("{}_work", name))
}

/// Expand, write the plan, and fail on branch failures unless `keep_going`
fn plan_and_write(
    workflow: &Workflow,
    resolver: &dyn SourceResolver,
    execution: &ExecutionConfig,
    plan_dir: &Path,
    keep_going: bool,
) -> Result<()> {
    let expanded = workflow
        .expand(resolver)
        .with_context(|| format!("Failed to expand workflow {}", workflow.name()))?;
    for failure in &expanded.failures {
        warn!(branch = %failure, "Branch failed");
    }

    let files = write_plan(plan_dir, workflow, &expanded, execution)
        .with_context(|| format!("Failed to write plan to {}", plan_dir.display()))?;
    info!(
        instances = expanded.instances.len(),
        failed = expanded.failures.len(),
        pruned = expanded.pruned,
        plan = %files.plan_json.display(),
        "Plan complete"
    );

    if !expanded.is_complete() && !keep_going {
        let failures: Vec<String> = expanded.failures.iter().map(ToString::to_string).collect();
        bail!(
            "{} branch(es) failed:\n  {}",
            failures.len(),
            failures.join("\n  ")
        );
    }
    Ok(())
}
