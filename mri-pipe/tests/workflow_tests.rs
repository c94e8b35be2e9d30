//! Workflow assembly and expansion integration tests
//!
//! Tests:
//! - Functional and structural branches share the realignment output
//! - Assembled graphs are acyclic with every required input connected
//! - A failed source tuple prunes only its own branch
//! - Plan export and level-1 result layout
//! - Level-1 results with a structural branch are found by the level-2 aggregator

mod helpers;

use helpers::{classification, measurement_tree, touch, write_measurement};
use mri_pipe::catalog::ScanCatalog;
use mri_pipe::execution::{ExecutionConfig, OutputType};
use mri_pipe::pipelines::diagnostic::{build_diagnostic, DiagnosticOptions, DIAGNOSTIC_WORK};
use mri_pipe::pipelines::level1::{build_level1, Level1Options};
use mri_pipe::pipelines::level2::{aggregate, AggregationRequest, Grouping};
use mri_pipe::pipelines::preprocessing::{build_preprocessing, PreprocessingOptions, Smoothing};
use mri_pipe::pipelines::{DataSelection, ScanTypeRequest, StructuralScans};
use mri_pipe::resolver::TieBreak;
use mri_pipe::selection::SelectionCriteria;
use mri_pipe::workflow::{write_plan, Interface, Workflow};
use serde_json::Value;
use tempfile::TempDir;

const TEMPLATE: &str = "/templates/ds_QBI_chr.nii.gz";

fn request(structural: StructuralScans) -> ScanTypeRequest {
    ScanTypeRequest {
        functional: vec!["EPI_CBV_alej".to_string()],
        structural,
    }
}

fn data(tree: &TempDir, criteria: SelectionCriteria, structural: StructuralScans) -> DataSelection {
    let classification = classification();
    let catalog = ScanCatalog::build(tree.path(), &classification).unwrap();
    DataSelection::prepare(catalog, criteria, &request(structural), &classification).unwrap()
}

/// Catalog with one measurement: 5502, ERC_ofM, EPI_CBV_alej and T2_TurboRARE
fn single_measurement() -> TempDir {
    let tree = TempDir::new().unwrap();
    write_measurement(
        tree.path(),
        "20170705_5502_ofM",
        "5502",
        "ERC_ofM",
        &[(3, "T2_TurboRARE"), (5, "EPI_CBV_alej")],
    );
    tree
}

fn execution(base: &TempDir) -> ExecutionConfig {
    ExecutionConfig::new(base.path().join("work"))
        .with_n_procs(4)
        .unwrap()
}

fn producer_of<'a>(workflow: &'a Workflow, consumer: &str, input: &str) -> Option<(&'a str, &'a str)> {
    let id = workflow.find(consumer)?;
    workflow
        .incoming(id)
        .find(|e| e.input == input)
        .map(|e| (workflow.nodes()[e.from.index()].name.as_str(), e.output.as_str()))
}

/// Acyclic and every required input connected or set
fn assert_valid(workflow: &Workflow) {
    workflow.validate().unwrap();
    let order = workflow.topological_order().unwrap();
    assert_eq!(order.len(), workflow.nodes().len());

    for edge in workflow.edges() {
        let from = order.iter().position(|id| *id == edge.from).unwrap();
        let to = order.iter().position(|id| *id == edge.to).unwrap();
        assert!(from < to, "edge against topological order");
    }

    for id in &order {
        let node = workflow.node(*id).unwrap();
        for port in node.interface.inputs().iter().filter(|p| p.required) {
            assert!(
                workflow.is_input_satisfied(*id, &port.name),
                "{}.{} unconnected",
                node.name,
                port.name
            );
        }
    }
}

#[test]
fn test_functional_and_structural_branches_share_realignment() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Types(vec!["T2_TurboRARE".to_string()]));
    let options = PreprocessingOptions::registration(TEMPLATE, Smoothing::None);
    let (workflow, nodes) = build_preprocessing(&data, &options, &execution(&tree)).unwrap();

    assert!(nodes.structural_output.is_some());
    assert_eq!(producer_of(&workflow, "functional_warp", "input_image"), Some(("realigner", "out_file")));
    assert_eq!(producer_of(&workflow, "structural_warp", "input_image"), Some(("realigner", "out_file")));
    assert_eq!(
        producer_of(&workflow, "structural_warp", "transforms"),
        Some(("structural_registration", "composite_transform"))
    );
    assert_eq!(
        producer_of(&workflow, "structural_BET", "in_file"),
        Some(("structural_cutoff", "out_file"))
    );
    assert_valid(&workflow);

    let expanded = workflow.expand(&data.resolver(TieBreak::default())).unwrap();
    assert!(expanded.is_complete());

    let functional: Vec<_> = expanded.instances_of("get_functional_scan").collect();
    assert_eq!(functional.len(), 1);
    let scan_path = functional[0].outputs["scan_path"].as_str().unwrap();
    assert!(scan_path.ends_with("20170705_5502_ofM/5"));

    let structural: Vec<_> = expanded.instances_of("get_structural_scan").collect();
    assert!(structural[0].outputs["scan_path"].as_str().unwrap().ends_with("20170705_5502_ofM/3"));
    assert_eq!(structural[0].bindings["structural_scan_type"], "T2_TurboRARE");
    assert_eq!(
        producer_of(&workflow, "structural_FAST", "in_files"),
        Some(("structural_voxel_resize", "resized_file"))
    );

    // one functional and one structural scan type: every node exists once
    assert_eq!(expanded.instances.len(), workflow.nodes().len());
}

#[test]
fn test_structural_branch_follows_scan_types() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Disabled);
    let options = PreprocessingOptions::registration(TEMPLATE, Smoothing::BlurXy { fwhm: 0.1 });
    let (workflow, nodes) = build_preprocessing(&data, &options, &execution(&tree)).unwrap();

    assert!(nodes.structural_output.is_none());
    assert!(workflow.find("get_structural_scan").is_none());
    assert!(workflow.find("structural_warp").is_none());
    assert_eq!(producer_of(&workflow, "functional_bandpass", "in_file"), Some(("blur", "out_file")));
    assert_valid(&workflow);
}

#[test]
fn test_lite_variant() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Classified);
    let (workflow, nodes) =
        build_preprocessing(&data, &PreprocessingOptions::lite(false), &execution(&tree)).unwrap();

    assert_eq!(workflow.name(), "preprocessing_lite");
    assert!(nodes.realigner.is_none());
    assert!(nodes.structural_conversion.is_some());
    assert!(workflow.find("functional_registration").is_none());
    assert_valid(&workflow);
}

#[test]
fn test_output_type_applied_to_fsl_nodes() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Disabled);
    let mut execution = execution(&tree);
    execution.output_type = OutputType::Nifti;
    let options = PreprocessingOptions::registration(TEMPLATE, Smoothing::None);
    let (workflow, _) = build_preprocessing(&data, &options, &execution).unwrap();

    for node in workflow.nodes() {
        let output_type = node.params.get("output_type");
        if node.interface.uses_output_type() {
            assert_eq!(output_type, Some(&Value::from("NIFTI")), "{}", node.name);
        } else {
            assert!(output_type.is_none(), "{}", node.name);
        }
    }
}

#[test]
fn test_failed_tuple_prunes_only_its_branch() {
    let tree = measurement_tree();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Disabled);
    assert_eq!(data.axes.conditions, vec!["ERC_ofM", "ERC_ofMaF"]);
    assert_eq!(data.axes.subjects, vec!["5502", "5503"]);

    let (workflow, _) =
        build_preprocessing(&data, &PreprocessingOptions::lite(true), &execution(&tree)).unwrap();
    let expanded = workflow.expand(&data.resolver(TieBreak::default())).unwrap();

    // 5503 was never measured under ERC_ofMaF
    assert_eq!(expanded.failures.len(), 1);
    let failure = &expanded.failures[0];
    assert_eq!(failure.node, "get_functional_scan");
    assert_eq!(failure.bindings["condition"], "ERC_ofMaF");
    assert_eq!(failure.bindings["subject"], "5503");
    assert!(failure.error.contains("Scan not found"));

    // conversion, resize and realignment of the failed tuple are pruned, the other three run
    assert_eq!(expanded.pruned, 3);
    assert_eq!(expanded.instances_of("functional_bru2nii").count(), 3);
    assert_eq!(expanded.instances_of("realigner").count(), 3);
    assert!(expanded
        .instances_of("realigner")
        .all(|i| !(i.bindings["condition"] == "ERC_ofMaF" && i.bindings["subject"] == "5503")));
}

#[test]
fn test_strict_policy_fails_ambiguous_branch() {
    let tree = measurement_tree();
    let criteria = SelectionCriteria::new().conditions(["ERC_ofM"]);
    let data = data(&tree, criteria, StructuralScans::Disabled);
    let (workflow, _) =
        build_preprocessing(&data, &PreprocessingOptions::lite(false), &execution(&tree)).unwrap();

    let lenient = workflow.expand(&data.resolver(TieBreak::FirstInCatalogOrder)).unwrap();
    assert!(lenient.is_complete());

    let strict = workflow.expand(&data.resolver(TieBreak::RejectAmbiguous)).unwrap();
    assert_eq!(strict.failures.len(), 1);
    assert_eq!(strict.failures[0].bindings["subject"], "5503");
    assert!(strict.failures[0].error.contains("Ambiguous"));
    assert_eq!(strict.instances_of("functional_bru2nii").count(), 1);
}

#[test]
fn test_level1_graph_and_result_layout() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Disabled);
    let execution = execution(&tree);
    let (workflow, _) = build_level1(&data, &Level1Options::new(TEMPLATE), &execution).unwrap();

    assert_valid(&workflow);
    assert_eq!(
        producer_of(&workflow, "specify_model", "subject_info"),
        Some(("timing_metadata", "total_delay_s"))
    );
    assert_eq!(
        producer_of(&workflow, "glm", "in_file"),
        Some(("functional_bandpass", "out_file"))
    );

    let expanded = workflow.expand(&data.resolver(TieBreak::default())).unwrap();
    let sink = expanded.instances_of("datasink").next().unwrap();
    let cope_dir = sink.outputs["cope"].as_str().unwrap();
    let expected = execution
        .base_dir
        .join("level1/results/cope/ERC_ofM.5502/_scan_type_EPI_CBV_alej");
    assert_eq!(cope_dir, expected.to_string_lossy());
}

#[test]
fn test_level1_uses_structural_series_when_present() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Classified);
    let (workflow, nodes) = build_level1(&data, &Level1Options::new(TEMPLATE), &execution(&tree)).unwrap();

    assert!(nodes.structural_output.is_some());
    assert_eq!(
        producer_of(&workflow, "glm", "in_file"),
        Some(("structural_bandpass", "out_file"))
    );
    assert_valid(&workflow);
}

#[test]
fn test_actual_size_skips_voxel_resize() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Disabled);
    let options = PreprocessingOptions::lite(true).with_actual_size(true);
    let (workflow, _) = build_preprocessing(&data, &options, &execution(&tree)).unwrap();

    assert!(workflow.find("functional_voxel_resize").is_none());
    assert_eq!(
        producer_of(&workflow, "realigner", "in_file"),
        Some(("functional_bru2nii", "nii_file"))
    );
    let conversion = &workflow.nodes()[workflow.find("functional_bru2nii").unwrap().index()];
    assert_eq!(conversion.params["actual_size"], Value::Bool(true));
    assert_valid(&workflow);
}

#[test]
fn test_level1_results_with_structural_feed_level2() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Classified);
    let execution = execution(&tree);
    let (workflow, _) = build_level1(&data, &Level1Options::new(TEMPLATE), &execution).unwrap();
    let expanded = workflow.expand(&data.resolver(TieBreak::default())).unwrap();
    assert!(expanded.is_complete());

    let sink = expanded.instances_of("datasink").next().unwrap();
    let cope_dir = sink.outputs["cope"].as_str().unwrap();
    let expected = execution
        .base_dir
        .join("level1/results/cope/ERC_ofM.5502/_scan_type_EPI_CBV_alej");
    assert_eq!(cope_dir, expected.to_string_lossy());

    // the engine writes the GLM outputs into the sink directories
    touch(&std::path::Path::new(cope_dir).join("cope.nii.gz"));
    touch(&std::path::Path::new(sink.outputs["varcb"].as_str().unwrap()).join("varcb.nii.gz"));

    let request = AggregationRequest {
        level1_dir: execution.base_dir.join("level1"),
        categories: Grouping::Flat(vec!["ERC_ofM".to_string()]),
        participants: vec!["5502".to_string()],
        scan_types: Grouping::Flat(vec!["EPI_CBV_alej".to_string()]),
    };
    let outcomes = aggregate(&request).unwrap();
    let inputs = outcomes[0].result.as_ref().unwrap();
    assert_eq!(inputs.copes.len(), 1);
    assert_eq!(inputs.varcbs.len(), 1);
}

#[test]
fn test_level1_rejects_several_structural_types() {
    let tree = single_measurement();
    let structural = StructuralScans::Types(vec!["T2_TurboRARE".to_string(), "T1_FLASH".to_string()]);
    let data = data(&tree, SelectionCriteria::new(), structural);
    let result = build_level1(&data, &Level1Options::new(TEMPLATE), &execution(&tree));
    assert!(matches!(result, Err(mri_pipe::PipelineError::Configuration(_))));
}

#[test]
fn test_diagnostic_workflow() {
    let tree = single_measurement();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Classified);
    let execution = execution(&tree);
    let options = DiagnosticOptions { realign: true, tr: 1.0 };
    let (workflow, _) = build_diagnostic(&data, &options, &execution).unwrap();

    assert_eq!(workflow.name(), DIAGNOSTIC_WORK);
    assert_eq!(producer_of(&workflow, "melodic", "in_files"), Some(("realigner", "out_file")));
    assert_eq!(
        producer_of(&workflow, "datasink", "MELODIC_reports"),
        Some(("melodic", "report_dir"))
    );
    assert_eq!(
        producer_of(&workflow, "datasink", "structural"),
        Some(("structural_voxel_resize", "resized_file"))
    );
    let melodic = &workflow.nodes()[workflow.find("melodic").unwrap().index()];
    assert_eq!(melodic.interface, Interface::Melodic);
    assert_eq!(melodic.params["dim"], Value::from(8));
    assert_valid(&workflow);
}

#[test]
fn test_plan_export() {
    let tree = measurement_tree();
    let data = data(&tree, SelectionCriteria::new(), StructuralScans::Disabled);
    let execution = execution(&tree);
    let (workflow, _) =
        build_preprocessing(&data, &PreprocessingOptions::lite(true), &execution).unwrap();
    let expanded = workflow.expand(&data.resolver(TieBreak::default())).unwrap();

    let plan_dir = execution.base_dir.join("preprocessing_lite_work");
    let files = write_plan(&plan_dir, &workflow, &expanded, &execution).unwrap();

    let plan: Value = serde_json::from_str(&std::fs::read_to_string(&files.plan_json).unwrap()).unwrap();
    assert_eq!(plan["workflow"], "preprocessing_lite");
    let generator = plan["generator"].as_str().unwrap();
    assert!(generator.starts_with(&format!("mri-pipe {} (", env!("CARGO_PKG_VERSION"))));
    assert_eq!(plan["plugin_args"]["n_procs"], 4);
    assert_eq!(plan["execution"]["plugin"], "MultiProc");
    assert_eq!(plan["expanded"]["failures"].as_array().unwrap().len(), 1);

    let graph: Value = serde_json::from_str(&std::fs::read_to_string(&files.graph_json).unwrap()).unwrap();
    assert_eq!(graph["nodes"].as_array().unwrap().len(), workflow.nodes().len());

    let dot = std::fs::read_to_string(&files.graph_dot).unwrap();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("realigner"));
}

#[test]
fn test_no_functional_scan_types_is_configuration_error() {
    let tree = single_measurement();
    let catalog = ScanCatalog::build(tree.path(), &classification()).unwrap();
    let request = ScanTypeRequest {
        functional: Vec::new(),
        structural: StructuralScans::Disabled,
    };
    let result = DataSelection::prepare(
        catalog,
        SelectionCriteria::new(),
        &request,
        &mri_pipe::catalog::ScanClassification::default(),
    );
    assert!(matches!(result, Err(mri_pipe::PipelineError::Configuration(_))));
}
