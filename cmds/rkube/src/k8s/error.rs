use std::error::Error;

/// Render an error followed by its whole source chain.
pub(crate) fn chain(err: &(dyn Error + 'static)) -> String {
	let mut rendered = err.to_string();
	let mut source = err.source();
	while let Some(cause) = source {
		rendered.push_str(": ");
		rendered.push_str(&cause.to_string());
		source = cause.source();
	}
	rendered
}

/// Join several errors, each with its source chain, with `separator`.
pub(crate) fn join<E: Error + 'static>(errors: &[E], separator: &str) -> String {
	errors
		.iter()
		.map(|err| chain(err))
		.collect::<Vec<_>>()
		.join(separator)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, thiserror::Error)]
	#[error("outer {0}")]
	struct Outer(u8, #[source] std::io::Error);

	#[test]
	fn test_join_renders_source_chains() {
		let errors = vec![
			Outer(1, std::io::Error::other("disk full")),
			Outer(2, std::io::Error::other("timed out")),
		];
		assert_eq!(
			join(&errors, " && "),
			"outer 1: disk full && outer 2: timed out"
		);
	}
}
