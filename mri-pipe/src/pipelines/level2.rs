//! Second-level aggregation
//!
//! Collects first-level cope and varcb volumes into merge groups and builds
//! the group-level workflow (merge → one-sample design → FLAMEO).
//!
//! # Input layout
//! ```text
//! <level1>/results/cope/<category>.<participant>/cope.nii.gz
//! <level1>/results/cope/<category>.<participant>/_scan_type_<type>/cope.nii.gz
//! <level1>/results/varcb/…/varcb.nii.gz
//! ```
//! Only tuples whose cope and varcb both exist are merged. A group without
//! any such tuple fails with `EmptyMergeInput`; the other groups are
//! unaffected.

use super::finalize;
use crate::bids_find::Level1Cope;
use crate::error::{PipelineError, Result};
use crate::execution::ExecutionConfig;
use crate::workflow::{EdgeAdapter, Interface, Node, SourceResolver, Workflow};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default pipeline (and result directory) name
pub const DEFAULT_LEVEL2_NAME: &str = "level2";

/// First-level statistic collected for the group analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    Cope,
    Varcb,
}

impl MapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cope => "cope",
            Self::Varcb => "varcb",
        }
    }

    /// `<level1>/results/<kind>`
    pub fn root(&self, level1_dir: &Path) -> PathBuf {
        level1_dir.join("results").join(self.as_str())
    }

    pub fn file_name(&self) -> String {
        format!("{}.nii.gz", self.as_str())
    }
}

/// A list of categories or scan types, flat or split into groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
    /// One list merged together
    Flat(Vec<String>),
    /// One merge group per inner list
    Nested(Vec<Vec<String>>),
}

impl Default for Grouping {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

impl Grouping {
    fn flat(&self) -> &[String] {
        match self {
            Self::Flat(values) => values,
            Self::Nested(_) => &[],
        }
    }
}

/// One merge group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationGroup {
    /// Group key, used in output file names
    pub key: String,
    pub categories: Vec<String>,
    /// Empty: files sit directly in the `<category>.<participant>` directory
    pub scan_types: Vec<String>,
}

/// Split categories and scan types into merge groups
///
/// At most one of the two may be nested; a flat request yields one group
/// keyed by its categories.
pub fn aggregation_groups(categories: &Grouping, scan_types: &Grouping) -> Result<Vec<AggregationGroup>> {
    match (categories, scan_types) {
        (Grouping::Nested(_), Grouping::Nested(_)) => Err(PipelineError::Configuration(
            "Categories and scan types cannot both be nested".to_string(),
        )),
        (Grouping::Nested(groups), scan_types) => Ok(groups
            .iter()
            .map(|group| AggregationGroup {
                key: group.join("+"),
                categories: group.clone(),
                scan_types: scan_types.flat().to_vec(),
            })
            .collect()),
        (Grouping::Flat(categories), Grouping::Nested(groups)) => Ok(groups
            .iter()
            .map(|group| AggregationGroup {
                key: group.join("+"),
                categories: categories.clone(),
                scan_types: group.clone(),
            })
            .collect()),
        (Grouping::Flat(categories), Grouping::Flat(scan_types)) => {
            if categories.is_empty() {
                return Err(PipelineError::Configuration(
                    "At least one category is required".to_string(),
                ));
            }
            Ok(vec![AggregationGroup {
                key: categories.join("+"),
                categories: categories.clone(),
                scan_types: scan_types.clone(),
            }])
        }
    }
}

/// First-level (cope, varcb) pairs of one group, in (category, participant, scan type) order
///
/// A tuple is kept only when both of its files exist.
pub fn level2_inputs(
    level1_dir: &Path,
    group: &AggregationGroup,
    participants: &[String],
) -> Vec<(PathBuf, PathBuf)> {
    let cope_root = MapKind::Cope.root(level1_dir);
    let varcb_root = MapKind::Varcb.root(level1_dir);
    let mut pairs = Vec::new();

    for category in &group.categories {
        for participant in participants {
            let dir = PathBuf::from(format!("{}.{}", category, participant));
            let tuples: Vec<PathBuf> = if group.scan_types.is_empty() {
                vec![dir]
            } else {
                group
                    .scan_types
                    .iter()
                    .map(|t| dir.join(format!("_scan_type_{}", t)))
                    .collect()
            };

            for tuple in tuples {
                let cope = cope_root.join(&tuple).join(MapKind::Cope.file_name());
                let varcb = varcb_root.join(&tuple).join(MapKind::Varcb.file_name());
                match (cope.is_file(), varcb.is_file()) {
                    (true, true) => pairs.push((cope, varcb)),
                    (false, false) => {
                        tracing::debug!(tuple = %tuple.display(), "Level-1 output missing, skipped")
                    }
                    (has_cope, has_varcb) => tracing::warn!(
                        tuple = %tuple.display(),
                        has_cope,
                        has_varcb,
                        "Level-1 cope without matching varcb, skipped"
                    ),
                }
            }
        }
    }

    pairs
}

/// One-sample group design (FSL L2Model)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesignSpec {
    /// Design matrix, one row per input volume
    pub matrix: Vec<Vec<f64>>,
    pub contrasts: Vec<(String, Vec<f64>)>,
    /// Covariance group per input volume
    pub groups: Vec<u32>,
}

/// Design file paths written by [`DesignSpec::write`]
#[derive(Debug, Clone)]
pub struct DesignFiles {
    pub mat: PathBuf,
    pub con: PathBuf,
    pub grp: PathBuf,
}

impl DesignSpec {
    /// Group mean over `num_copes` volumes
    pub fn one_sample(num_copes: usize) -> Self {
        Self {
            matrix: vec![vec![1.0]; num_copes],
            contrasts: vec![("group mean".to_string(), vec![1.0])],
            groups: vec![1; num_copes],
        }
    }

    pub fn num_copes(&self) -> usize {
        self.matrix.len()
    }

    fn num_waves(&self) -> usize {
        self.matrix.first().map(Vec::len).unwrap_or(0)
    }

    /// `design.mat` in VEST format
    pub fn to_mat(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "/NumWaves\t{}", self.num_waves());
        let _ = writeln!(out, "/NumPoints\t{}", self.num_copes());
        let _ = writeln!(out, "/PPheights\t{}", vest_row(&vec![1.0; self.num_waves()]));
        out.push_str("\n/Matrix\n");
        for row in &self.matrix {
            let _ = writeln!(out, "{}", vest_row(row));
        }
        out
    }

    /// `design.con` in VEST format
    pub fn to_con(&self) -> String {
        let mut out = String::new();
        for (index, (name, _)) in self.contrasts.iter().enumerate() {
            let _ = writeln!(out, "/ContrastName{}\t{}", index + 1, name);
        }
        let _ = writeln!(out, "/NumWaves\t{}", self.num_waves());
        let _ = writeln!(out, "/NumContrasts\t{}", self.contrasts.len());
        let _ = writeln!(out, "/PPheights\t{}", vest_row(&vec![1.0; self.contrasts.len()]));
        out.push_str("\n/Matrix\n");
        for (_, weights) in &self.contrasts {
            let _ = writeln!(out, "{}", vest_row(weights));
        }
        out
    }

    /// `design.grp` in VEST format
    pub fn to_grp(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "/NumWaves\t1");
        let _ = writeln!(out, "/NumPoints\t{}", self.groups.len());
        out.push_str("\n/Matrix\n");
        for group in &self.groups {
            let _ = writeln!(out, "{}", group);
        }
        out
    }

    /// Write `design.mat`, `design.con` and `design.grp` into `dir`
    pub fn write(&self, dir: &Path) -> Result<DesignFiles> {
        std::fs::create_dir_all(dir)?;
        let files = DesignFiles {
            mat: dir.join("design.mat"),
            con: dir.join("design.con"),
            grp: dir.join("design.grp"),
        };
        std::fs::write(&files.mat, self.to_mat())?;
        std::fs::write(&files.con, self.to_con())?;
        std::fs::write(&files.grp, self.to_grp())?;
        Ok(files)
    }
}

fn vest_row(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:.6}", v))
        .collect::<Vec<_>>()
        .join("\t")
}

/// Merge inputs of one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupInputs {
    pub copes: Vec<PathBuf>,
    pub varcbs: Vec<PathBuf>,
    pub design: DesignSpec,
}

impl GroupInputs {
    /// Split (cope, varcb) pairs of one group and derive its design
    pub fn from_pairs(group: &str, pairs: Vec<(PathBuf, PathBuf)>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(PipelineError::EmptyMergeInput {
                group: group.to_string(),
            });
        }
        let (copes, varcbs): (Vec<PathBuf>, Vec<PathBuf>) = pairs.into_iter().unzip();
        let design = DesignSpec::one_sample(copes.len());
        Ok(Self {
            copes,
            varcbs,
            design,
        })
    }
}

/// Aggregation result of one group
#[derive(Debug)]
pub struct GroupOutcome {
    pub key: String,
    pub result: Result<GroupInputs>,
}

/// What to aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRequest {
    pub level1_dir: PathBuf,
    pub categories: Grouping,
    pub participants: Vec<String>,
    pub scan_types: Grouping,
}

/// Collect merge inputs for every group
///
/// Grouping errors fail the whole call before the filesystem is touched;
/// empty groups fail individually.
pub fn aggregate(request: &AggregationRequest) -> Result<Vec<GroupOutcome>> {
    let groups = aggregation_groups(&request.categories, &request.scan_types)?;
    if request.participants.is_empty() {
        return Err(PipelineError::Configuration(
            "At least one participant is required".to_string(),
        ));
    }

    let outcomes: Vec<GroupOutcome> = groups
        .iter()
        .map(|group| {
            let pairs = level2_inputs(&request.level1_dir, group, &request.participants);
            let result = GroupInputs::from_pairs(&group.key, pairs);
            log_outcome(&group.key, &result);
            GroupOutcome {
                key: group.key.clone(),
                result,
            }
        })
        .collect();

    Ok(outcomes)
}

pub(crate) fn log_outcome(key: &str, result: &Result<GroupInputs>) {
    match result {
        Ok(inputs) => tracing::info!(group = %key, copes = inputs.copes.len(), "Merge group collected"),
        Err(e) => tracing::warn!(group = %key, error = %e, "Merge group failed"),
    }
}

/// Grouping key of a BIDS-layout level-1 tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Subject,
    Session,
    Scan,
}

impl GroupBy {
    fn key<'a>(&self, cope: &'a Level1Cope) -> &'a str {
        match self {
            Self::Subject => &cope.subject,
            Self::Session => &cope.session,
            Self::Scan => &cope.scan,
        }
    }
}

impl FromStr for GroupBy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subject" => Ok(Self::Subject),
            "session" => Ok(Self::Session),
            "scan" => Ok(Self::Scan),
            other => Err(PipelineError::Configuration(format!(
                "Group-by must be subject, session or scan, got {}",
                other
            ))),
        }
    }
}

/// Group BIDS-layout level-1 copes by subject, session or scan
///
/// Groups come out sorted by key. Copes of excluded subjects and copes
/// without a varcb are left out; a group left without copes fails with
/// `EmptyMergeInput`.
pub fn bids_groups(copes: &[Level1Cope], group_by: GroupBy, exclude_subjects: &[String]) -> Vec<GroupOutcome> {
    let mut grouped: BTreeMap<&str, Vec<&Level1Cope>> = BTreeMap::new();
    for cope in copes {
        grouped.entry(group_by.key(cope)).or_default().push(cope);
    }

    grouped
        .into_iter()
        .map(|(key, members)| {
            let pairs: Vec<(PathBuf, PathBuf)> = members
                .into_iter()
                .filter(|c| !exclude_subjects.contains(&c.subject))
                .filter_map(|c| match &c.varcb {
                    Some(varcb) => Some((c.cope.clone(), varcb.clone())),
                    None => {
                        tracing::warn!(cope = %c.cope.display(), "Level-1 cope without matching varcb, skipped");
                        None
                    }
                })
                .collect();
            let result = GroupInputs::from_pairs(key, pairs);
            log_outcome(key, &result);
            GroupOutcome {
                key: key.to_string(),
                result,
            }
        })
        .collect()
}

/// Resolves level-2 source nodes from aggregation outcomes
pub struct GroupResolver<'a> {
    outcomes: &'a [GroupOutcome],
}

impl<'a> GroupResolver<'a> {
    pub fn new(outcomes: &'a [GroupOutcome]) -> Self {
        Self { outcomes }
    }
}

impl SourceResolver for GroupResolver<'_> {
    fn resolve(&self, node: &Node, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        let group = super::string_input(node, inputs, "group")?;
        let outcome = self
            .outcomes
            .iter()
            .find(|o| o.key == group)
            .ok_or_else(|| PipelineError::EmptyMergeInput {
                group: group.to_string(),
            })?;

        match &outcome.result {
            Ok(group_inputs) => Ok(BTreeMap::from([
                ("copes".to_string(), json!(group_inputs.copes)),
                ("varcbs".to_string(), json!(group_inputs.varcbs)),
            ])),
            Err(PipelineError::EmptyMergeInput { group }) => Err(PipelineError::EmptyMergeInput {
                group: group.clone(),
            }),
            Err(e) => Err(PipelineError::Configuration(e.to_string())),
        }
    }
}

/// Group-level settings
#[derive(Debug, Clone, PartialEq)]
pub struct Level2Options {
    /// Pipeline name; results go to `<workflow_base>/<name>`
    pub name: String,
    /// Binary brain mask in template space
    pub mask: PathBuf,
}

impl Level2Options {
    pub fn new(mask: impl Into<PathBuf>) -> Self {
        Self {
            name: DEFAULT_LEVEL2_NAME.to_string(),
            mask: mask.into(),
        }
    }
}

/// Build the group-level workflow iterating over `group_keys`
pub fn build_level2(
    group_keys: &[String],
    options: &Level2Options,
    execution: &ExecutionConfig,
) -> Result<Workflow> {
    let mut workflow = Workflow::new(options.name.clone());

    let infosource = workflow.add_node("infosource", Interface::identity(["group"]))?;
    workflow.set_iterables(infosource, "group", group_keys.iter().cloned())?;

    let datasource = workflow.add_node("datasource", Interface::Level2Source)?;
    workflow.connect(infosource, "group", datasource, "group")?;

    let copemerge = workflow.add_node("copemerge", Interface::Merge)?;
    workflow.connect(datasource, "copes", copemerge, "in_files")?;
    workflow.connect_with(
        infosource,
        "group",
        copemerge,
        "merged_file",
        EdgeAdapter::append_suffix("_cope.nii.gz"),
    )?;

    let varcopemerge = workflow.add_node("varcopemerge", Interface::Merge)?;
    workflow.connect(datasource, "varcbs", varcopemerge, "in_files")?;
    workflow.connect_with(
        infosource,
        "group",
        varcopemerge,
        "merged_file",
        EdgeAdapter::append_suffix("_varcb.nii.gz"),
    )?;

    let level2model = workflow.add_node("level2model", Interface::L2Model)?;
    workflow.connect_with(datasource, "copes", level2model, "num_copes", EdgeAdapter::Count)?;

    let flameo = workflow.add_node("flameo", Interface::Flameo)?;
    workflow.set_param(flameo, "mask_file", options.mask.to_string_lossy().into_owned())?;
    workflow.connect(copemerge, "merged_file", flameo, "cope_file")?;
    workflow.connect(varcopemerge, "merged_file", flameo, "var_cope_file")?;
    workflow.connect_all(
        level2model,
        flameo,
        &[
            ("design_mat", "design_file"),
            ("design_grp", "cov_split_file"),
            ("design_con", "t_con_file"),
        ],
    )?;

    let datasink = workflow.add_node("datasink", Interface::DataSink)?;
    let results = execution.base_dir.join(&options.name);
    workflow.set_param(datasink, "base_directory", results.to_string_lossy().into_owned())?;
    workflow.set_param(datasink, "substitutions", json!([["_group_", ""]]))?;
    workflow.connect_all(
        flameo,
        datasink,
        &[
            ("copes", "@copes"),
            ("fstats", "@fstats"),
            ("tstats", "@tstats"),
            ("zstats", "@zstats"),
        ],
    )?;

    finalize(workflow, execution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_on_both_axes_rejected() {
        let nested = Grouping::Nested(vec![vec!["a".to_string()]]);
        assert!(matches!(
            aggregation_groups(&nested, &nested),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_nested_categories_make_one_group_each() {
        let categories = Grouping::Nested(vec![
            vec!["ofM".to_string()],
            vec!["ofM_aF".to_string(), "ofM_cF1".to_string()],
        ]);
        let groups = aggregation_groups(&categories, &Grouping::Flat(vec!["EPI".to_string()])).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].key, "ofM_aF+ofM_cF1");
        assert_eq!(groups[1].scan_types, vec!["EPI"]);
    }

    #[test]
    fn test_flat_without_categories_rejected() {
        assert!(aggregation_groups(&Grouping::default(), &Grouping::default()).is_err());
    }

    #[test]
    fn test_one_sample_design_files() {
        let design = DesignSpec::one_sample(3);
        let mat = design.to_mat();
        assert!(mat.starts_with("/NumWaves\t1\n/NumPoints\t3\n"));
        assert!(mat.ends_with("/Matrix\n1.000000\n1.000000\n1.000000\n"));
        assert!(design.to_con().contains("/NumContrasts\t1"));
        assert!(design.to_grp().ends_with("/Matrix\n1\n1\n1\n"));
    }

    fn cope(subject: &str, session: &str) -> Level1Cope {
        let dir = PathBuf::from(format!("/l1/sub-{}/ses-{}", subject, session));
        Level1Cope {
            subject: subject.to_string(),
            session: session.to_string(),
            scan: "EPI".to_string(),
            cope: dir.join("cope.nii.gz"),
            varcb: Some(dir.join("varcb.nii.gz")),
        }
    }

    #[test]
    fn test_bids_groups_by_session_with_exclusion() {
        let copes = vec![cope("5502", "ofM"), cope("5503", "ofM"), cope("5502", "ofMaF"), cope("5503", "ofMaF")];
        let excluded = vec!["5503".to_string()];
        let outcomes = bids_groups(&copes, GroupBy::Session, &excluded);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].key, "ofM");
        let inputs = outcomes[0].result.as_ref().unwrap();
        assert_eq!(inputs.copes, vec![PathBuf::from("/l1/sub-5502/ses-ofM/cope.nii.gz")]);
        assert_eq!(inputs.design.num_copes(), 1);
    }

    #[test]
    fn test_bids_group_emptied_by_exclusion() {
        let outcomes = bids_groups(&[cope("5502", "ofM")], GroupBy::Subject, &["5502".to_string()]);
        assert!(matches!(outcomes[0].result, Err(PipelineError::EmptyMergeInput { .. })));
    }

    #[test]
    fn test_bids_cope_without_varcb_left_out() {
        let mut lone = cope("5503", "ofM");
        lone.varcb = None;
        let outcomes = bids_groups(&[cope("5502", "ofM"), lone], GroupBy::Session, &[]);

        let inputs = outcomes[0].result.as_ref().unwrap();
        assert_eq!(inputs.copes, vec![PathBuf::from("/l1/sub-5502/ses-ofM/cope.nii.gz")]);
        assert_eq!(inputs.varcbs, vec![PathBuf::from("/l1/sub-5502/ses-ofM/varcb.nii.gz")]);
    }

    #[test]
    fn test_group_by_parse() {
        assert_eq!("scan".parse::<GroupBy>().unwrap(), GroupBy::Scan);
        assert!(matches!("trial".parse::<GroupBy>(), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_empty_group_inputs() {
        assert!(matches!(
            GroupInputs::from_pairs("ofM", Vec::new()),
            Err(PipelineError::EmptyMergeInput { group }) if group == "ofM"
        ));
    }
}
