#![no_main]
use libfuzzer_sys::fuzz_target;

use vliwra::{lower, lower_lds, Options};
use vliwra_util::fuzzing::FuzzProgram;
use vliwra_util::parser;

fuzz_target!(|program: FuzzProgram| {
  let mut shader = match lower(&program.0, Options::default().trans_slot) {
    Ok(shader) => shader,
    Err(_) => return,
  };
  shader.remove_dead_code();
  lower_lds(&mut shader);

  let printed = shader.render();
  let parsed = parser::parse_content(&printed).expect("parser error");
  let reprinted = parsed.render();
  assert_eq!(printed, reprinted);

  let reparsed = parser::parse_content(&reprinted).expect("shouldn't error on the second parse!");
  assert_eq!(reprinted, reparsed.render());
});
