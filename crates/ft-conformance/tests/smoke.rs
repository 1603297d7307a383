use ft_conformance::{
    Contiguity, DimType, HarnessConfig, SampleInput, TestParams, find_njt_op,
    include_dim_type_and_contiguity, njt_op_db, run_reference_matrix,
};
use ft_core::{DType, Device};

fn quiet(seed: u64) -> HarnessConfig {
    HarnessConfig {
        log_path: None,
        seed: Some(seed),
        ..HarnessConfig::default_paths()
    }
}

#[test]
fn reference_matrix_report_is_stable() {
    let cfg = quiet(7);
    let (first, first_logs) = run_reference_matrix(&cfg).expect("matrix should run");
    let (second, second_logs) = run_reference_matrix(&cfg).expect("matrix should rerun");

    assert_eq!(first.suite, "njt_reference_matrix");
    assert!(first.cases_passed > 0);
    assert_eq!(first, second);
    let names = |logs: &[ft_conformance::StructuredCaseLog]| {
        logs.iter()
            .map(|log| (log.scenario_id.clone(), log.outcome.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&first_logs), names(&second_logs));
}

#[test]
fn dimwise_ops_expand_per_dim_type_and_layout() {
    let transpose = find_njt_op("transpose").expect("transpose");
    let params = TestParams::new(transpose, Device::Cpu, DType::F32);
    let variants = include_dim_type_and_contiguity("test_forward", &params);
    assert_eq!(variants.len(), DimType::ALL.len() * Contiguity::ALL.len());
    assert_eq!(variants[0].0, "test_forward_batch_dim_contig");
    assert!(
        variants
            .iter()
            .all(|(_, params)| params.dim_type.is_some() && params.contiguity.is_some())
    );

    let abs = find_njt_op("abs").expect("abs");
    let variants =
        include_dim_type_and_contiguity("test_forward", &TestParams::new(abs, Device::Cpu, DType::F32));
    let names: Vec<&str> = variants.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        [
            "test_forward_contig",
            "test_forward_noncontig_transposed",
            "test_forward_noncontig_holes"
        ]
    );
}

#[test]
fn every_catalog_entry_is_translated() {
    let db = njt_op_db();
    assert_eq!(db.len(), ft_dispatch::op_db().len());
    let unsupported: Vec<&str> = db
        .values()
        .filter(|op| !op.supports_njt)
        .map(|op| op.op.name)
        .collect();
    assert!(unsupported.contains(&"softmax"));
    assert!(!unsupported.contains(&"bmm"));

    let softmax = find_njt_op("softmax").expect("softmax");
    let err = softmax
        .reference_output(&SampleInput::new(ft_core::DenseTensor::zeros(
            vec![2],
            DType::F32,
            Device::Cpu,
        )))
        .expect_err("unsupported op should error");
    assert!(err.to_string().contains("softmax"));
}
