//! Logger bootstrap, the way `mkrawimg`'s `main()` sets one up: a single
//! `colog` basic builder, level switched by a debug flag, initialized
//! exactly once for the life of the process.
use log::LevelFilter;

pub fn init(debug: bool) {
	let mut logger = colog::basic_builder();
	logger.filter(None, if debug { LevelFilter::Debug } else { LevelFilter::Info });
	logger.init();
	if debug {
		log::debug!("Debug output enabled.");
	}
}
