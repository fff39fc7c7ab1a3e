//! Sequential quadratic programming for smooth objectives under one linear
//! equality and per-variable bounds.
//!
//! Each iteration solves
//!
//! ```text
//! min_d  ½ dᵀ B d + gᵀ d   s.t.  aᵀ d = 0,  lower - x <= d <= upper - x
//! ```
//!
//! with a primal active-set method, where `B` is a damped BFGS approximation
//! of the Hessian. All constraints are linear, so iterates stay feasible and
//! the objective itself serves as the merit function for an Armijo line
//! search.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::MarkowitzError;
use crate::MarkowitzResult;

const FEASIBILITY_TOLERANCE: f64 = 1e-9;
const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-10;
const MULTIPLIER_TOLERANCE: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A smooth function to minimise.
pub trait Objective: Sync {
    fn value(&self, x: &[f64]) -> MarkowitzResult<f64>;
    fn gradient(&self, x: &[f64]) -> MarkowitzResult<Vec<f64>>;
}

/// `equality · x = rhs` and `lower <= x <= upper`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraints {
    pub equality: Vec<f64>,
    pub rhs: f64,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SqpSettings {
    pub max_iterations: u32,
    /// Converged once the QP step is this small in every coordinate.
    pub tolerance: f64,
    /// Converged once the (predicted or actual) relative decrease is this small.
    pub ftol: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqpOutcome {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: u32,
    pub converged: bool,
    /// Largest component of the projected steepest-descent step at `x`.
    pub kkt_residual: f64,
    pub message: String,
}

impl LinearConstraints {
    /// Weights summing to one with a common box.
    pub fn simplex_box(n: usize, lower: f64, upper: f64) -> Self {
        LinearConstraints {
            equality: vec![1.0; n],
            rhs: 1.0,
            lower: vec![lower; n],
            upper: vec![upper; n],
        }
    }

    fn validate(&self, n: usize) -> MarkowitzResult<()> {
        if self.equality.len() != n || self.lower.len() != n || self.upper.len() != n {
            return Err(MarkowitzError::InvalidInput {
                field: "constraints".into(),
                reason: format!("Constraint vectors must all have length {}", n),
            });
        }
        if self.equality.iter().all(|a| *a == 0.0) {
            return Err(MarkowitzError::InvalidInput {
                field: "constraints.equality".into(),
                reason: "Equality coefficients are all zero".into(),
            });
        }
        if let Some(i) = (0..n).find(|&i| self.lower[i] > self.upper[i]) {
            return Err(MarkowitzError::InvalidInput {
                field: "constraints".into(),
                reason: format!("lower[{}] > upper[{}]", i, i),
            });
        }
        Ok(())
    }

    fn check_feasible(&self, x: &[f64]) -> MarkowitzResult<()> {
        for (i, xi) in x.iter().enumerate() {
            if !xi.is_finite()
                || *xi < self.lower[i] - FEASIBILITY_TOLERANCE
                || *xi > self.upper[i] + FEASIBILITY_TOLERANCE
            {
                return Err(MarkowitzError::ConstraintViolation {
                    reason: format!(
                        "Starting point x[{}] = {} outside [{}, {}]",
                        i, xi, self.lower[i], self.upper[i]
                    ),
                });
            }
        }
        let lhs = dot(&self.equality, x);
        if (lhs - self.rhs).abs() > FEASIBILITY_TOLERANCE * self.rhs.abs().max(1.0) {
            return Err(MarkowitzError::ConstraintViolation {
                reason: format!("Starting point gives a·x = {} instead of {}", lhs, self.rhs),
            });
        }
        Ok(())
    }

    fn clamp(&self, x: &mut [f64]) {
        for (i, xi) in x.iter_mut().enumerate() {
            *xi = xi.clamp(self.lower[i], self.upper[i]);
        }
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// Minimise `objective` from a feasible `x0`.
///
/// Running out of iterations or failing the line search is reported through
/// `converged = false`; errors are reserved for bad inputs and objectives
/// that cannot be evaluated at the starting point.
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    x0: &[f64],
    constraints: &LinearConstraints,
    settings: &SqpSettings,
) -> MarkowitzResult<SqpOutcome> {
    let n = x0.len();
    if n == 0 {
        return Err(MarkowitzError::InsufficientData(
            "At least one variable required".into(),
        ));
    }
    constraints.validate(n)?;
    constraints.check_feasible(x0)?;

    let mut x = x0.to_vec();
    constraints.clamp(&mut x);
    let mut f = objective.value(&x)?;
    let mut g = objective.gradient(&x)?;
    check_finite(f, &g)?;

    let mut hessian = DMatrix::<f64>::identity(n, n);
    let mut converged = false;
    let mut message = String::from("Iteration limit reached");
    let mut iterations = 0u32;

    while iterations < settings.max_iterations {
        iterations += 1;

        let (lo, hi) = step_bounds(&x, constraints);
        let d = solve_qp(&hessian, &g, &constraints.equality, &lo, &hi)?;
        let step_norm = inf_norm(&d);
        trace!(iteration = iterations, f, step_norm, "sqp iteration");

        if step_norm <= settings.tolerance {
            converged = true;
            message = "Optimization terminated successfully (KKT conditions satisfied)".into();
            break;
        }

        let slope = dot(&g, &d);
        if slope.abs() <= settings.ftol * f.abs().max(1.0) {
            converged = true;
            message = "Optimization terminated successfully (predicted decrease below ftol)".into();
            break;
        }
        if slope >= 0.0 {
            message = "Search direction is not a descent direction".into();
            break;
        }

        let Some((x_new, f_new)) = line_search(objective, constraints, &x, &d, f, slope) else {
            message = "Line search failed to find a sufficient decrease".into();
            break;
        };
        let g_new = objective.gradient(&x_new)?;
        check_finite(f_new, &g_new)?;

        let s = DVector::from_iterator(n, x_new.iter().zip(&x).map(|(a, b)| a - b));
        let y = DVector::from_iterator(n, g_new.iter().zip(&g).map(|(a, b)| a - b));
        damped_bfgs_update(&mut hessian, &s, &y);

        let decrease = f - f_new;
        x = x_new;
        f = f_new;
        g = g_new;

        if decrease.abs() <= settings.ftol * f.abs().max(1.0) {
            converged = true;
            message = "Optimization terminated successfully (objective change below ftol)".into();
            break;
        }
    }

    let kkt_residual = kkt_residual(&x, &g, constraints)?;
    debug!(iterations, converged, f, kkt_residual, "sqp finished");

    Ok(SqpOutcome {
        x,
        value: f,
        iterations,
        converged,
        kkt_residual,
        message,
    })
}

/// Backtrack from the full step until the Armijo condition holds.
fn line_search<O: Objective + ?Sized>(
    objective: &O,
    constraints: &LinearConstraints,
    x: &[f64],
    d: &[f64],
    f: f64,
    slope: f64,
) -> Option<(Vec<f64>, f64)> {
    let mut alpha = 1.0;
    while alpha >= MIN_STEP {
        let mut candidate: Vec<f64> = x.iter().zip(d).map(|(xi, di)| xi + alpha * di).collect();
        constraints.clamp(&mut candidate);
        if let Ok(value) = objective.value(&candidate) {
            if value.is_finite() && value <= f + ARMIJO * alpha * slope {
                return Some((candidate, value));
            }
        }
        alpha *= 0.5;
    }
    None
}

/// Projected steepest-descent step size: zero exactly at a KKT point.
fn kkt_residual(x: &[f64], g: &[f64], constraints: &LinearConstraints) -> MarkowitzResult<f64> {
    let n = x.len();
    let (lo, hi) = step_bounds(x, constraints);
    let d = solve_qp(&DMatrix::identity(n, n), g, &constraints.equality, &lo, &hi)?;
    Ok(inf_norm(&d))
}

/// Step box `lower - x <= d <= upper - x`, widened to always contain zero.
fn step_bounds(x: &[f64], constraints: &LinearConstraints) -> (Vec<f64>, Vec<f64>) {
    let lo = x
        .iter()
        .zip(&constraints.lower)
        .map(|(xi, l)| (l - xi).min(0.0))
        .collect();
    let hi = x
        .iter()
        .zip(&constraints.upper)
        .map(|(xi, u)| (u - xi).max(0.0))
        .collect();
    (lo, hi)
}

// ---------------------------------------------------------------------------
// QP subproblem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Free,
    Lower,
    Upper,
}

/// Primal active-set method for
/// `min ½ dᵀBd + gᵀd  s.t.  a·d = 0, lo <= d <= hi`, starting from `d = 0`.
///
/// `B` must be positive definite.
fn solve_qp(
    b: &DMatrix<f64>,
    g: &[f64],
    a: &[f64],
    lo: &[f64],
    hi: &[f64],
) -> MarkowitzResult<Vec<f64>> {
    let n = g.len();
    let mut d = vec![0.0; n];
    let mut state = vec![Bound::Free; n];

    for _ in 0..(10 * n + 50) {
        let free: Vec<usize> = (0..n).filter(|&i| state[i] == Bound::Free).collect();
        let (target, nu) = solve_equality_qp(b, g, a, &d, &free)?;
        let p: Vec<f64> = free.iter().zip(&target).map(|(&i, t)| t - d[i]).collect();

        if inf_norm(&p) <= 1e-14 {
            for (&i, t) in free.iter().zip(&target) {
                d[i] = *t;
            }
            // Release the bound with the most negative multiplier, if any.
            let grad = gradient_of_model(b, g, &d);
            let mut worst: Option<(usize, f64)> = None;
            for i in 0..n {
                let r = grad[i] - nu * a[i];
                let violation = match state[i] {
                    Bound::Free => continue,
                    Bound::Lower => -r,
                    Bound::Upper => r,
                };
                if violation > MULTIPLIER_TOLERANCE && worst.map_or(true, |(_, v)| violation > v) {
                    worst = Some((i, violation));
                }
            }
            match worst {
                None => return Ok(d),
                Some((i, _)) => state[i] = Bound::Free,
            }
            continue;
        }

        let mut alpha = 1.0;
        let mut blocking = None;
        for (k, &i) in free.iter().enumerate() {
            if p[k] < 0.0 {
                let t = (lo[i] - d[i]) / p[k];
                if t < alpha {
                    alpha = t;
                    blocking = Some((i, Bound::Lower));
                }
            } else if p[k] > 0.0 {
                let t = (hi[i] - d[i]) / p[k];
                if t < alpha {
                    alpha = t;
                    blocking = Some((i, Bound::Upper));
                }
            }
        }
        let alpha = alpha.max(0.0);
        for (k, &i) in free.iter().enumerate() {
            d[i] += alpha * p[k];
        }
        if let Some((i, side)) = blocking {
            d[i] = if side == Bound::Lower { lo[i] } else { hi[i] };
            state[i] = side;
        }
    }

    // Cycling on a degenerate vertex; the current point is feasible and no
    // worse than d = 0.
    debug!("qp subproblem hit its iteration limit");
    Ok(d)
}

/// Solve for the free coordinates with bound coordinates held at their
/// current values. Returns the free coordinates and the equality multiplier.
fn solve_equality_qp(
    b: &DMatrix<f64>,
    g: &[f64],
    a: &[f64],
    d: &[f64],
    free: &[usize],
) -> MarkowitzResult<(Vec<f64>, f64)> {
    let m = free.len();
    let fixed: Vec<usize> = (0..d.len()).filter(|i| !free.contains(i)).collect();

    let mut kkt = DMatrix::<f64>::zeros(m + 1, m + 1);
    let mut rhs = DVector::<f64>::zeros(m + 1);
    for (k, &i) in free.iter().enumerate() {
        for (l, &j) in free.iter().enumerate() {
            kkt[(k, l)] = b[(i, j)];
        }
        kkt[(k, m)] = -a[i];
        kkt[(m, k)] = a[i];
        rhs[k] = -g[i] - fixed.iter().map(|&j| b[(i, j)] * d[j]).sum::<f64>();
    }
    rhs[m] = -fixed.iter().map(|&j| a[j] * d[j]).sum::<f64>();

    let Some(solution) = kkt.lu().solve(&rhs) else {
        return Err(MarkowitzError::Numerical(
            "Singular KKT system in QP subproblem".into(),
        ));
    };
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(MarkowitzError::Numerical(
            "Non-finite solution of QP subproblem".into(),
        ));
    }
    Ok((solution.rows(0, m).iter().copied().collect(), solution[m]))
}

fn gradient_of_model(b: &DMatrix<f64>, g: &[f64], d: &[f64]) -> Vec<f64> {
    let bd = b * DVector::from_column_slice(d);
    bd.iter().zip(g).map(|(x, y)| x + y).collect()
}

/// Powell-damped BFGS update, keeping `b` positive definite.
fn damped_bfgs_update(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
    let bs = &*b * s;
    let sbs = s.dot(&bs);
    if sbs <= 1e-16 {
        return;
    }
    let sy = s.dot(y);
    let theta = if sy >= 0.2 * sbs {
        1.0
    } else {
        0.8 * sbs / (sbs - sy)
    };
    let r = y * theta + &bs * (1.0 - theta);
    let sr = s.dot(&r);
    if sr <= 1e-16 {
        return;
    }
    *b += &r * r.transpose() / sr - &bs * bs.transpose() / sbs;
    let symmetric = (&*b + b.transpose()) * 0.5;
    *b = symmetric;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

fn check_finite(f: f64, g: &[f64]) -> MarkowitzResult<()> {
    if !f.is_finite() || g.iter().any(|v| !v.is_finite()) {
        return Err(MarkowitzError::Numerical(
            "Objective or gradient is not finite".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ½ ||x - c||²
    struct Distance(Vec<f64>);

    impl Objective for Distance {
        fn value(&self, x: &[f64]) -> MarkowitzResult<f64> {
            let squares: f64 = x.iter().zip(&self.0).map(|(a, c)| (a - c).powi(2)).sum();
            Ok(0.5 * squares)
        }
        fn gradient(&self, x: &[f64]) -> MarkowitzResult<Vec<f64>> {
            Ok(x.iter().zip(&self.0).map(|(a, c)| a - c).collect())
        }
    }

    /// c · x
    struct Linear(Vec<f64>);

    impl Objective for Linear {
        fn value(&self, x: &[f64]) -> MarkowitzResult<f64> {
            Ok(dot(&self.0, x))
        }
        fn gradient(&self, _x: &[f64]) -> MarkowitzResult<Vec<f64>> {
            Ok(self.0.clone())
        }
    }

    fn settings() -> SqpSettings {
        SqpSettings {
            max_iterations: 100,
            tolerance: 1e-10,
            ftol: 0.0,
        }
    }

    #[test]
    fn test_projection_onto_simplex() {
        let obj = Distance(vec![0.8, 0.6, -0.5]);
        let cons = LinearConstraints::simplex_box(3, 0.0, 1.0);
        let out = minimize(&obj, &[1.0 / 3.0; 3], &cons, &settings()).unwrap();
        assert!(out.converged, "{}", out.message);
        let expected = [0.6, 0.4, 0.0];
        for (x, e) in out.x.iter().zip(expected) {
            assert!((x - e).abs() < 1e-8, "{:?}", out.x);
        }
        assert!(out.kkt_residual < 1e-8);
    }

    #[test]
    fn test_interior_minimum() {
        let obj = Distance(vec![0.2, 0.3, 0.5]);
        let cons = LinearConstraints::simplex_box(3, 0.0, 1.0);
        let out = minimize(&obj, &[0.6, 0.2, 0.2], &cons, &settings()).unwrap();
        assert!(out.converged);
        assert!((out.x[0] - 0.2).abs() < 1e-8);
        assert!((out.x[2] - 0.5).abs() < 1e-8);
        assert!(out.value.abs() < 1e-14);
    }

    #[test]
    fn test_linear_objective_reaches_vertex() {
        let obj = Linear(vec![0.0, -1.0, 0.5]);
        let cons = LinearConstraints::simplex_box(3, 0.0, 1.0);
        let out = minimize(&obj, &[1.0 / 3.0; 3], &cons, &settings()).unwrap();
        assert!(out.converged, "{}", out.message);
        assert!((out.x[1] - 1.0).abs() < 1e-9, "{:?}", out.x);
        assert!(out.x[0].abs() < 1e-9 && out.x[2].abs() < 1e-9);
    }

    #[test]
    fn test_upper_bounds_respected() {
        let obj = Linear(vec![0.0, -1.0, 0.5]);
        let cons = LinearConstraints::simplex_box(3, 0.0, 0.5);
        let out = minimize(&obj, &[1.0 / 3.0; 3], &cons, &settings()).unwrap();
        assert!(out.converged, "{}", out.message);
        assert!((out.x[1] - 0.5).abs() < 1e-9, "{:?}", out.x);
        assert!((out.x[0] - 0.5).abs() < 1e-9, "{:?}", out.x);
        assert!(out.x.iter().all(|x| *x <= 0.5 + 1e-12 && *x >= 0.0));
    }

    #[test]
    fn test_infeasible_start_rejected() {
        let obj = Linear(vec![1.0, 1.0]);
        let cons = LinearConstraints::simplex_box(2, 0.0, 1.0);
        let err = minimize(&obj, &[0.7, 0.7], &cons, &settings()).unwrap_err();
        assert!(matches!(err, MarkowitzError::ConstraintViolation { .. }));
    }

    #[test]
    fn test_iteration_limit_reported() {
        let obj = Distance(vec![0.8, 0.6, -0.5]);
        let cons = LinearConstraints::simplex_box(3, 0.0, 1.0);
        let tight = SqpSettings {
            max_iterations: 1,
            tolerance: 1e-14,
            ftol: 0.0,
        };
        let out = minimize(&obj, &[0.0, 0.0, 1.0], &cons, &tight).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 1);
        assert_eq!(out.message, "Iteration limit reached");
    }

    #[test]
    fn test_bfgs_update_keeps_positive_definite() {
        let mut b = DMatrix::<f64>::identity(2, 2);
        let s = DVector::from_vec(vec![1.0, 0.0]);
        // Negative curvature pair would break plain BFGS.
        let y = DVector::from_vec(vec![-1.0, 0.0]);
        damped_bfgs_update(&mut b, &s, &y);
        let eig = b.symmetric_eigen().eigenvalues;
        assert!(eig.iter().all(|e| *e > 0.0), "{eig}");
    }
}
