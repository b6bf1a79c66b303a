pub mod archive;
pub mod file;
pub mod paths;
pub mod platform;

#[cfg(test)]
pub(crate) mod test_support;
