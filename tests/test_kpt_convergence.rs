mod common;

use common::{fast_settings, write_inputs, MockVasp, ScriptedSg};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use visejob::config::KptConvSettings;
use visejob::convergence::{ConvergenceError, ConvergenceSequence};
use visejob::handlers::{ErrorHandler, UnconvergedErrorHandler};
use visejob::input_set::TemplateInputGenerator;
use visejob::job::VaspJob;
use visejob::kpt_convergence::ConvergenceLoop;
use visejob::record::RunRecord;

fn convergence_loop(dir: &Path, vasp: MockVasp, analyzer: ScriptedSg) -> ConvergenceLoop {
    let mut settings = fast_settings(5);
    settings.remove_wavecar = true;
    let handlers: Vec<Box<dyn ErrorHandler>> = vec![Box::new(UnconvergedErrorHandler::new())];
    let job = VaspJob::with_handlers(dir, settings, Box::new(vasp), Box::new(analyzer), handlers);
    let generator = TemplateInputGenerator::from_directory(dir, 0.01, 5.0).unwrap();
    ConvergenceLoop::new(job, Box::new(generator), KptConvSettings::default())
}

fn wavecars_left(dir: &Path) -> usize {
    let mut count = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            count += wavecars_left(&path);
        } else if path.file_name().map_or(false, |n| n == "WAVECAR") {
            count += 1;
        }
    }
    count
}

#[test]
fn test_converges_and_links_result() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_inputs(dir);
    fs::write(dir.join("vise_config.cfg"), "[convergence]\ncriterion = 0.003\n").unwrap();
    let (vasp, state) = MockVasp::new(vec![1]);

    let mut kc = convergence_loop(dir, vasp, ScriptedSg::fixed(225));
    let sequence = kc.run(2.5, 1.2, 10).unwrap();

    // Meshes 4, 5, 6, 7; the 5x5x5 set agrees with both later ones within 3 meV/atom.
    assert_eq!(sequence.len(), 4);
    assert_eq!(state.launches.get(), 4);
    let meshes: Vec<u32> = sequence.records().iter().map(|r| r.kpt_mesh[0]).collect();
    assert_eq!(meshes, vec![4, 5, 6, 7]);
    let densities: Vec<f64> = sequence.records().iter().filter_map(|r| r.kpt_density).collect();
    assert_eq!(densities.len(), 4);
    assert!((densities[1] - 3.0).abs() < 1e-9);

    let converged = sequence.converged_record().unwrap();
    assert_eq!(converged.dirname(), "kpt5x5x5_pre-sg225_pos-sg225");

    for record in sequence.records() {
        assert!(dir.join(record.dirname()).join("structure_opt.json").exists());
    }
    // Every set after the first starts from the previous wavefunction.
    assert_eq!(state.wavecar_reused.get(), 3);
    assert_eq!(wavecars_left(dir), 0);
    // The campaign settings stay put for a later resume.
    assert!(dir.join("vise_config.cfg").is_file());
    assert!(!dir.join("kpt4x4x4_pre-sg225_pos-sg225").join("vise_config.cfg").exists());

    #[cfg(unix)]
    {
        let link = fs::read_link(dir.join("CONTCAR.finish")).unwrap();
        assert_eq!(link, Path::new("kpt5x5x5_pre-sg225_pos-sg225").join("CONTCAR.finish"));
        let link = fs::read_link(dir.join("KPOINTS")).unwrap();
        assert_eq!(link, Path::new("kpt5x5x5_pre-sg225_pos-sg225").join("KPOINTS"));
    }
}

#[test]
fn test_not_converged_then_resumed() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_inputs(dir);
    let generator = TemplateInputGenerator::from_directory(dir, 0.01, 5.0).unwrap();

    let (vasp, first) = MockVasp::new(vec![1]);
    let job = VaspJob::with_handlers(dir, fast_settings(5), Box::new(vasp), Box::new(ScriptedSg::fixed(225)), Vec::new());
    let mut kc = ConvergenceLoop::new(job, Box::new(generator.clone()), KptConvSettings::default());
    match kc.run(2.5, 1.2, 2) {
        Err(ConvergenceError::NotConverged { iterations }) => assert_eq!(iterations, 2),
        other => panic!("expected NotConverged, got {:?}", other.map(|s| s.len())),
    }
    assert_eq!(first.launches.get(), 2);
    assert!(!dir.join("CONTCAR.finish").exists());

    // A fresh loop picks up the two finished sets from disk.
    let (vasp, second) = MockVasp::new(vec![1]);
    let job = VaspJob::with_handlers(dir, fast_settings(5), Box::new(vasp), Box::new(ScriptedSg::fixed(225)), Vec::new());
    let mut kc = ConvergenceLoop::new(job, Box::new(generator), KptConvSettings::default());
    let sequence = kc.run(2.5, 1.2, 10).unwrap();

    assert_eq!(second.launches.get(), 2);
    assert_eq!(sequence.len(), 4);
    assert_eq!(sequence.records()[2].prev_record_id, Some(sequence.records()[1].id));
    assert_eq!(sequence.records()[2].kpt_mesh, [6, 6, 6]);
    assert!(dir.join("CONTCAR.finish").exists());
}

#[test]
fn test_symmetry_change_restarts_density() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_inputs(dir);
    let (vasp, state) = MockVasp::new(vec![1]);
    // First relaxation: final structure 221, starting structure 225.
    let analyzer = ScriptedSg::new(&[221, 225, 221]);

    let mut kc = convergence_loop(dir, vasp, analyzer);
    let sequence = kc.run(2.5, 1.2, 10).unwrap();

    let records = sequence.records();
    assert_eq!(records[0].dirname(), "kpt4x4x4_pre-sg225_pos-sg221");
    assert_eq!(records[1].dirname(), "kpt4x4x4_pre-sg221_pos-sg221");
    assert_eq!(records[1].kpt_density, Some(2.5));
    assert_eq!(sequence.len(), 5);
    assert_eq!(state.launches.get(), 5);
    assert_eq!(
        sequence.converged_record().unwrap().dirname(),
        "kpt5x5x5_pre-sg221_pos-sg221"
    );
}

#[test]
fn test_iteration_cap_of_one() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_inputs(dir);
    let (vasp, state) = MockVasp::new(vec![1]);

    let mut kc = convergence_loop(dir, vasp, ScriptedSg::fixed(225));
    let err = kc.run(2.5, 1.2, 1).unwrap_err();
    assert!(matches!(err, ConvergenceError::NotConverged { iterations: 1 }));
    assert_eq!(state.launches.get(), 1);
}

#[test]
fn test_broken_chain_on_disk_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_inputs(dir);
    let (vasp, _) = MockVasp::new(vec![1]);
    let mut kc = convergence_loop(dir, vasp, ScriptedSg::fixed(225));
    kc.run(2.5, 1.2, 1).unwrap_err();

    // A second root beside the finished set.
    let first = dir.join("kpt4x4x4_pre-sg225_pos-sg225");
    let mut orphan = RunRecord::load(&first).unwrap();
    orphan.id = uuid::Uuid::new_v4();
    orphan.kpt_mesh = [9, 9, 9];
    let orphan_dir = dir.join(orphan.dirname());
    fs::create_dir(&orphan_dir).unwrap();
    orphan.save(&orphan_dir).unwrap();

    let err = ConvergenceSequence::from_dirs(dir, &KptConvSettings::default()).unwrap_err();
    assert!(matches!(err, ConvergenceError::ChainIntegrity(_)));
    assert!(matches!(kc.run(2.5, 1.2, 5), Err(ConvergenceError::ChainIntegrity(_))));
}

#[test]
fn test_record_json_file_round_trip() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_inputs(dir);
    let (vasp, _) = MockVasp::new(vec![1]);
    let mut kc = convergence_loop(dir, vasp, ScriptedSg::fixed(225));
    kc.run(2.5, 1.2, 1).unwrap_err();

    let path = dir.join("kpt4x4x4_pre-sg225_pos-sg225").join("structure_opt.json");
    let record = RunRecord::load_file(&path).unwrap();
    assert_eq!(record.kpt_density, Some(2.5));
    assert_eq!(record.final_structure.species, vec!["Cu".to_string()]);
    assert!(record.to_string().contains("225"));
}
