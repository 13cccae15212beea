//! Add build information.

use std::error::Error;

use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
	EmitBuilder::builder().fail_on_error().all_build().emit()?;
	Ok(())
}
