/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use std::fs;

use vliwra::{Options, RegisterBudget};
use vliwra_util::test_cases::{self, find_test};
use vliwra_util::test_framework::{check_results, run_test};

use clap;
use log::{error, info};
use pretty_env_logger;

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("vliwra")
    .about("a driver to run the vliwra back end on test shaders")
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .required_unless_present("list")
        .help("test case name, a built-in program or a file of the shader directory"),
    )
    .arg(
      clap::Arg::new("registers")
        .short('r')
        .takes_value(true)
        .help("number of general purpose registers (124 if not set)"),
    )
    .arg(
      clap::Arg::new("dump")
        .short('d')
        .takes_value(true)
        .help("write the shader metadata to this file, bincode encoded"),
    )
    .arg(clap::Arg::new("no-bundle").long("no-bundle").help("one instruction per group"))
    .arg(
      clap::Arg::new("no-trans-slot")
        .long("no-trans-slot")
        .help("target a VLIW4 part without a transcendental slot"),
    )
    .arg(clap::Arg::new("no-checker").long("no-checker").help("skip the allocation checker"))
    .arg(clap::Arg::new("list").short('l').long("list").help("list the available tests"));
  let matches = app.get_matches();

  if matches.is_present("list") {
    print_names(test_cases::program_names().iter().map(|n| n.to_string()));
    print_names(test_cases::shader_files().into_iter().map(|(stem, _)| stem));
    return;
  }

  let mut options = Options::default();
  options.bundle = !matches.is_present("no-bundle");
  options.trans_slot = !matches.is_present("no-trans-slot");
  options.run_checker = !matches.is_present("no-checker");
  if let Some(regs) = matches.value_of("registers") {
    options.budget = match regs.parse::<i32>() {
      Ok(n) if n > 0 => budget_with(n),
      _ => {
        println!("invalid register count '{}'", regs);
        return;
      }
    };
  }

  let test_name = match matches.value_of("test") {
    Some(name) => name,
    None => return,
  };
  let input = match find_test(test_name) {
    Ok(input) => input,
    Err(names) => {
      error!("can't find a test named '{}'", test_name);
      println!("available tests are:");
      print_names(names.into_iter());
      return;
    }
  };

  let outcome = match run_test(input, &options) {
    Ok(o) => o,
    Err(e) => {
      println!("compilation failed: {}", e);
      return;
    }
  };

  println!("{}", outcome.shader.render());
  println!("registers used: {}", outcome.info.num_gprs);

  if let Some(path) = matches.value_of("dump") {
    match bincode::serialize(&outcome.info) {
      Ok(bytes) => {
        if let Err(e) = fs::write(path, bytes) {
          println!("can't write {}: {}", path, e);
        }
      }
      Err(e) => println!("can't encode shader metadata: {}", e),
    }
  }

  match check_results(&outcome.before, &outcome.after) {
    Ok(()) => info!("results agree"),
    Err(e) => {
      println!("{}", e);
      std::process::exit(1);
    }
  }
}

/// Budget with `n` general purpose registers; the clause-local ones follow.
fn budget_with(n: i32) -> RegisterBudget {
  let default = RegisterBudget::default();
  let clause_local = default.clause_local_end - default.clause_local_start;
  RegisterBudget {
    registers_end: n,
    clause_local_start: n,
    clause_local_end: n + clause_local,
    ..default
  }
}

fn print_names(names: impl Iterator<Item = String>) {
  for name in names {
    println!("     {}", name);
  }
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use vliwra_util::parser::parse_file;
  use vliwra_util::test_framework::Outcome;

  pub fn run(name: &str, options: &Options) -> Result<Outcome, String> {
    let _ = pretty_env_logger::try_init();
    let input = find_test(name).unwrap_or_else(|names| {
      panic!("no test {}; known: {:?}", name, names);
    });
    run_test(input, options)
  }

  pub fn check(name: &str, options: &Options) {
    let outcome = run(name, options).unwrap_or_else(|err| {
      panic!("compilation of {} failed: {}", name, err);
    });
    if let Err(e) = outcome.before.as_ref() {
      panic!("{} doesn't run before allocation: {}", name, e);
    }
    if let Err(e) = check_results(&outcome.before, &outcome.after) {
      panic!("{}:\n{}\n{}", name, e, outcome.shader.render());
    }
  }

  pub fn check_all_variants(name: &str) {
    check(name, &Options::default());
    check(name, &Options { bundle: false, ..Options::default() });
    check(name, &Options { trans_slot: false, ..Options::default() });
  }

  pub fn check_text_round_trip(name: &str) {
    let path = test_cases::shader_files()
      .into_iter()
      .find(|(stem, _)| stem == name)
      .map(|(_, path)| path)
      .unwrap_or_else(|| panic!("no shader file {}", name));
    let text = fs::read_to_string(&path).unwrap();
    let shader = parse_file(&path).unwrap_or_else(|e| panic!("{}", e));
    assert_eq!(shader.render(), text);
  }
}

#[test]
fn straight_line() {
  test_utils::check_all_variants("straight_line");
}

#[test]
fn if_else() {
  test_utils::check_all_variants("if_else");
}

#[test]
fn loop_counter() {
  test_utils::check_all_variants("loop_counter");
}

#[test]
fn nested_loops() {
  test_utils::check_all_variants("nested_loops");
}

#[test]
fn switch() {
  test_utils::check_all_variants("switch");
}

#[test]
fn array_indirect() {
  test_utils::check_all_variants("array_indirect");
}

#[test]
fn lds() {
  test_utils::check_all_variants("lds");
}

#[test]
fn fetch_export() {
  test_utils::check_all_variants("fetch_export");
}

#[test]
fn trans_chain() {
  test_utils::check_all_variants("trans_chain");
}

#[test]
fn dot_product() {
  test_utils::check_all_variants("dot_product");
}

#[test]
fn uniforms() {
  test_utils::check_all_variants("uniforms");
}

#[test]
fn blocks() {
  test_utils::check_all_variants("blocks");
}

#[test]
fn kill() {
  test_utils::check_all_variants("kill");
}

#[test]
fn pressure() {
  test_utils::check("pressure", &Options::default());
  // Forty values live at once don't fit in a handful of registers.
  let tight = Options { budget: budget_with(2), ..Options::default() };
  assert!(test_utils::run("pressure", &tight).is_err());
}

#[test]
fn checker_can_be_skipped() {
  test_utils::check("loop_counter", &Options { run_checker: false, ..Options::default() });
}

#[test]
fn text_swizzle_export() {
  test_utils::check_text_round_trip("swizzle_export");
  test_utils::check_all_variants("swizzle_export");
}

#[test]
fn text_counted_loop() {
  test_utils::check_text_round_trip("counted_loop");
  test_utils::check_all_variants("counted_loop");
}

#[test]
fn unknown_test_lists_names() {
  let names = match find_test("no_such_test") {
    Err(names) => names,
    Ok(_) => panic!("found a test that doesn't exist"),
  };
  assert!(names.iter().any(|n| n == "straight_line"));
  assert!(names.iter().any(|n| n == "counted_loop"));
}
