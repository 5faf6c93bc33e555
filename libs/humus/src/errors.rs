//! Joined errors: several failures reported as one value while each stays
//! individually detectable.

use std::error::Error as StdError;
use std::fmt;

/// A multi-error whose constituents remain inspectable.
///
/// Built by [`join`]. `Display` prints one constituent per line.
#[derive(Debug)]
pub struct JoinedError {
    errors: Vec<anyhow::Error>,
}

impl JoinedError {
    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.errors.iter()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_inner(self) -> Vec<anyhow::Error> {
        self.errors
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{e:#}")?;
        }
        Ok(())
    }
}

impl StdError for JoinedError {}

/// Joins errors into one. Returns `None` for no errors and the error itself
/// when there is exactly one.
pub fn join<I>(errors: I) -> Option<anyhow::Error>
where
    I: IntoIterator<Item = anyhow::Error>,
{
    let mut errors: Vec<anyhow::Error> = errors.into_iter().collect();
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => Some(anyhow::Error::new(JoinedError { errors })),
    }
}

/// Reports whether `err`, any error in its source chain, or any joined
/// constituent (recursively) is an `E` satisfying `pred`.
pub fn is<E>(err: &anyhow::Error, pred: impl Fn(&E) -> bool) -> bool
where
    E: StdError + Send + Sync + 'static,
{
    is_inner(err, &pred)
}

/// Reports whether an `E` of any value appears anywhere in `err`.
pub fn is_kind<E>(err: &anyhow::Error) -> bool
where
    E: StdError + Send + Sync + 'static,
{
    is::<E>(err, |_| true)
}

fn is_inner<E>(err: &anyhow::Error, pred: &dyn Fn(&E) -> bool) -> bool
where
    E: StdError + Send + Sync + 'static,
{
    // anyhow downcasts through its own context layers
    if err.downcast_ref::<E>().is_some_and(pred) {
        return true;
    }
    err.chain().any(|cause| {
        if cause.downcast_ref::<E>().is_some_and(pred) {
            return true;
        }
        match cause.downcast_ref::<JoinedError>() {
            Some(joined) => joined.iter().any(|e| is_inner(e, pred)),
            None => false,
        }
    })
}
