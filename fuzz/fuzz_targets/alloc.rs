#![no_main]
use libfuzzer_sys::fuzz_target;

use std::sync::atomic::{AtomicUsize, Ordering};

use vliwra::{compile, CompileError, Options};
use vliwra_util::fuzzing::FuzzProgram;
use vliwra_util::test_framework::{check_results, run_program};

static COUNTER_GEN: AtomicUsize = AtomicUsize::new(0);
static COUNTER_OK: AtomicUsize = AtomicUsize::new(0);

fuzz_target!(|program: FuzzProgram| {
  let gen = COUNTER_GEN.fetch_add(1, Ordering::Relaxed) + 1;
  if gen % 1000 == 0 {
    println!(
      "STATUS: {} generated, {} compiled",
      gen,
      COUNTER_OK.load(Ordering::Relaxed)
    );
  }

  let options = Options::default();
  match compile(&program.0, &options) {
    Ok(_) => {}
    Err(CompileError::Checker(errors)) => panic!("checker errors: {:?}", errors.errors),
    // Out of registers and the like are legitimate answers.
    Err(_) => return,
  }
  COUNTER_OK.fetch_add(1, Ordering::Relaxed);

  let outcome = run_program(&program.0, &options).expect("second compilation failed");
  if let Err(e) = check_results(&outcome.before, &outcome.after) {
    panic!("{}\n{}", e, outcome.shader.render());
  }
});
