//! **laminate**: inverse identification of a two-layer laminate from its
//! effective elastic coefficients, with hand-coded derivatives.
//!
//! Given five measured coefficients (h1111, h1133, h1313, h1212, h3333) the
//! crate recovers both layers' Young's modulus and Poisson ratio plus the
//! volume fraction of layer 1:
//!
//! 1. **Model** (`homogenization`): closed-form mixing, exact Jacobian.
//! 2. **Loss** (`objectives`): sum of squared relative residuals.
//! 3. **Gradients** (`gradients`): chain rule through the Jacobian.
//! 4. **Stage A** (`adam`): fixed-budget Adam, single precision by default.
//! 5. **Stage B** (`lbfgs`, `optimizer`): L-BFGS to tolerance in double
//!    precision, built-in strong-Wolfe or argmin Moré-Thuente.
//! 6. **Config** (`config`): TOML run configuration.

pub mod precision;
pub mod types;
pub mod homogenization;
pub mod objectives;
pub mod gradients;
pub mod adam;
pub mod lbfgs;
pub mod optimizer;
pub mod config;
