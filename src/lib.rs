pub mod mr;
pub mod mrapps;
pub mod mrrt;

mod util;

#[cfg(test)]
mod test_mr;
