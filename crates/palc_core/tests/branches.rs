//! End-to-end continuation scenarios.

use nalgebra::{DMatrix, DVector};
use palc_core::continuation::fold_curve::newton_fold;
use palc_core::continuation::hopf_curve::newton_hopf;
use palc_core::linear::LinearSolve;
use palc_core::{
    jacobian_spectrum, norm_theta, BifStatus, BifurcationKind, BorderedPair, BorderingBls,
    ContIterator, ContinuationParams, DenseEigen, DenseLu, FnSystem, Hooks, JacOp, LinearSolver,
    MatrixFreeBls, NewtonParams, Predictor, StabilityRule, StopReason, VectorField,
};

fn cubic_field() -> FnSystem<
    impl Fn(&DVector<f64>, f64) -> DVector<f64>,
    impl Fn(&DVector<f64>, f64) -> DMatrix<f64>,
> {
    FnSystem::new(
        |u: &DVector<f64>, p: f64| DVector::from_vec(vec![p + u[0] - u[0].powi(3)]),
        |u: &DVector<f64>, _p: f64| DMatrix::from_element(1, 1, 1.0 - 3.0 * u[0] * u[0]),
    )
}

/// Scalar fold of the cubic nullcline `F(x, r) = r + x − x³`.
#[test]
fn scalar_fold_branch() {
    let field = cubic_field();
    let eig = DenseEigen::default();
    let bls = BorderingBls::new(DenseLu);

    let params = ContinuationParams {
        ds: -0.01,
        ds_min: 1e-4,
        ds_max: 0.02,
        p_min: -1.0,
        p_max: 4.1,
        max_steps: 600,
        detect_fold: true,
        compute_eigenvalues: true,
        nev: 1,
        ..ContinuationParams::default()
    };

    let hooks = Hooks {
        print_solution: Some(Box::new(|u: &DVector<f64>, _p| u[0])),
        ..Hooks::default()
    };

    let x0 = DVector::from_vec(vec![0.8]);
    let it = ContIterator::new(&field, &bls, x0, 1.0, params, Predictor::Secant)
        .unwrap()
        .with_spectrum(jacobian_spectrum(&field, &eig), StabilityRule::RealPart)
        .with_hooks(hooks)
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none(), "failure: {:?}", out.failure);
    assert_eq!(out.record.stop, Some(StopReason::BoundaryReached));

    // The starting point solves the cubic at r = 1 and printsol traces x.
    let first = &out.record.points[0];
    assert_eq!(first.step, 0);
    assert!((first.printsol - 1.3247).abs() < 1e-3);

    // Exactly one fold near r = 2/(3√3), refined in-engine by the fold
    // defining system.
    let expected = 2.0 / (3.0 * 3.0_f64.sqrt());
    let near: Vec<_> = out
        .record
        .foldpoints
        .iter()
        .filter(|f| (f.param - expected).abs() < 1e-4)
        .collect();
    assert_eq!(near.len(), 1, "folds: {:?}", out.record.foldpoints.len());
    assert_eq!(near[0].status, BifStatus::Converged);
    assert!((near[0].param - expected).abs() < 1e-8);
    // The parameter tangent vanishes at the refined fold.
    assert!(near[0].tau.p.abs() <= 1e-6);
    assert!((near[0].u[0] + 1.0 / 3.0_f64.sqrt()).abs() < 1e-6);
    // Its mirror image is crossed too on the way to p_min.
    assert!(out
        .record
        .foldpoints
        .iter()
        .any(|f| (f.param + expected).abs() < 1e-4));

    // Record invariants: every |ds| within bounds, steps in order.
    for (i, pt) in out.record.points.iter().enumerate() {
        assert_eq!(pt.step, i);
        let ads = pt.ds.abs();
        assert!(ads >= params.ds_min * (1.0 - 1e-12) && ads <= params.ds_max * (1.0 + 1e-12));
    }

    // Confirmed tangent is a unit vector of the arclength metric.
    assert!((norm_theta(&out.tau, params.theta, None) - 1.0).abs() < 1e-10);

    // Last point still solves F to Newton tolerance.
    let f = field.eval(&out.last.u, out.last.p).unwrap();
    assert!(f[0].abs() <= params.newton.tol * 10.0);

    // The standalone defining-system Newton agrees with the in-engine
    // refinement, here seeded without a null-vector hint.
    let guess = near[0];
    let refined = newton_fold(
        &field,
        &guess.u,
        guess.param,
        None,
        None,
        &NewtonParams::default(),
        &bls,
        1e-7,
    )
    .unwrap();
    assert!(refined.converged);
    assert!((refined.p - expected).abs() < 1e-8);
    assert!((3.0 * refined.x[0] * refined.x[0] - 1.0).abs() < 1e-6);
}

/// Bisection localization of a simple eigenvalue crossing.
#[test]
fn bisection_locates_simple_crossing() {
    let field = FnSystem::new(
        |u: &DVector<f64>, p: f64| DVector::from_vec(vec![(p - 0.5) * u[0]]),
        |_u: &DVector<f64>, p: f64| DMatrix::from_element(1, 1, p - 0.5),
    );
    let eig = DenseEigen::default();
    let bls = BorderingBls::new(DenseLu);

    let ds_min_bisection = 1e-4;
    let params = ContinuationParams {
        ds: 0.1,
        ds_max: 0.1,
        p_min: -1.0,
        p_max: 1.0,
        max_steps: 12,
        detect_fold: false,
        detect_bifurcation: 2,
        compute_eigenvalues: true,
        nev: 1,
        n_inversion: 10,
        max_bisection_steps: 60,
        ds_min_bisection,
        ..ContinuationParams::default()
    };

    let x0 = DVector::from_vec(vec![0.0]);
    let it = ContIterator::new(&field, &bls, x0, 0.05, params, Predictor::Natural)
        .unwrap()
        .with_spectrum(jacobian_spectrum(&field, &eig), StabilityRule::RealPart)
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none(), "failure: {:?}", out.failure);

    assert_eq!(out.record.bifpoints.len(), 1);
    let bif = &out.record.bifpoints[0];
    assert_eq!(bif.kind, BifurcationKind::BranchPoint);
    assert_eq!(bif.status, BifStatus::Converged);
    assert_eq!(bif.delta, (1, 0));
    assert!(
        (bif.param - 0.5).abs() < 2.0 * ds_min_bisection,
        "p_found = {}",
        bif.param
    );
}

/// Hopf detection on the two-species Brusselator ODE, followed by Newton
/// refinement with the Hopf defining system.
#[test]
fn brusselator_hopf() {
    // u' = A + u²v − (B+1)u, v' = Bu − u²v with A = 1; Hopf at B = 2, ω = 1.
    let a = 1.0;
    let field = FnSystem::new(
        move |u: &DVector<f64>, b: f64| {
            DVector::from_vec(vec![
                a + u[0] * u[0] * u[1] - (b + 1.0) * u[0],
                b * u[0] - u[0] * u[0] * u[1],
            ])
        },
        move |u: &DVector<f64>, b: f64| {
            DMatrix::from_row_slice(
                2,
                2,
                &[
                    2.0 * u[0] * u[1] - (b + 1.0),
                    u[0] * u[0],
                    b - 2.0 * u[0] * u[1],
                    -u[0] * u[0],
                ],
            )
        },
    );
    let eig = DenseEigen::default();
    let bls = BorderingBls::new(DenseLu);

    let params = ContinuationParams {
        ds: 0.05,
        ds_max: 0.05,
        p_min: 1.0,
        p_max: 3.0,
        max_steps: 60,
        detect_fold: false,
        detect_bifurcation: 2,
        compute_eigenvalues: true,
        nev: 2,
        n_inversion: 8,
        max_bisection_steps: 50,
        ds_min_bisection: 1e-5,
        ..ContinuationParams::default()
    };

    let b0 = 1.5;
    let x0 = DVector::from_vec(vec![a, b0 / a]);
    let it = ContIterator::new(&field, &bls, x0, b0, params, Predictor::Secant)
        .unwrap()
        .with_spectrum(jacobian_spectrum(&field, &eig), StabilityRule::RealPart)
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none(), "failure: {:?}", out.failure);

    let hopfs: Vec<_> = out
        .record
        .bifpoints
        .iter()
        .filter(|b| b.kind == BifurcationKind::Hopf)
        .collect();
    assert_eq!(hopfs.len(), 1);
    let detected = hopfs[0];
    assert!((detected.param - 2.0).abs() < 1e-3, "B = {}", detected.param);
    assert_eq!(detected.delta, (2, 2));

    let refined = newton_hopf(
        &field,
        &detected.u,
        detected.param,
        None,
        None,
        &NewtonParams::default(),
        &DenseLu,
        1e-7,
    )
    .unwrap();
    assert!(refined.converged);
    assert!((refined.p - 2.0).abs() < 1e-8);
    assert!((refined.omega - 1.0).abs() < 1e-8);
}

/// Fold of a discretized boundary-value problem (Chan).
#[test]
fn chan_boundary_value_fold() {
    let n = 50usize;
    let h = 1.0 / (n as f64 + 1.0);
    let beta = 0.01;
    let (ca, cb) = (0.5, 0.01);

    let nl = move |x: f64| 1.0 + (x + ca * x * x) / (1.0 + cb * x * x);
    let nl_d = move |x: f64| {
        let den = 1.0 + cb * x * x;
        ((1.0 + 2.0 * ca * x) * den - (x + ca * x * x) * 2.0 * cb * x) / (den * den)
    };

    let field = FnSystem::new(
        move |u: &DVector<f64>, alpha: f64| {
            let mut out = DVector::zeros(n);
            for i in 0..n {
                let left = if i == 0 { beta } else { u[i - 1] };
                let right = if i + 1 == n { beta } else { u[i + 1] };
                out[i] = (left - 2.0 * u[i] + right) / (h * h) + alpha * nl(u[i]);
            }
            out
        },
        move |u: &DVector<f64>, alpha: f64| {
            let mut jac = DMatrix::zeros(n, n);
            for i in 0..n {
                jac[(i, i)] = -2.0 / (h * h) + alpha * nl_d(u[i]);
                if i > 0 {
                    jac[(i, i - 1)] = 1.0 / (h * h);
                }
                if i + 1 < n {
                    jac[(i, i + 1)] = 1.0 / (h * h);
                }
            }
            jac
        },
    );
    let bls = BorderingBls::new(DenseLu);

    let params = ContinuationParams {
        ds: 0.01,
        ds_min: 1e-5,
        ds_max: 0.05,
        p_min: 0.5,
        p_max: 4.1,
        max_steps: 250,
        detect_fold: true,
        newton: NewtonParams {
            tol: 1e-9,
            max_iter: 30,
            ..NewtonParams::default()
        },
        ..ContinuationParams::default()
    };

    let x0 = DVector::from_element(n, beta);
    let it = ContIterator::new(&field, &bls, x0, 3.0, params, Predictor::Secant)
        .unwrap()
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none(), "failure: {:?}", out.failure);

    assert!(
        !out.record.foldpoints.is_empty(),
        "no fold found before stop {:?}",
        out.record.stop
    );
    let fold = &out.record.foldpoints[0];
    assert!(
        fold.param > 2.0 && fold.param < 4.0,
        "fold at alpha = {}",
        fold.param
    );
}

/// Dense-by-probing Krylov stand-in: materializes any augmented operator by
/// applying it to basis pairs, then solves with LU.
struct BasisLu;

impl BasisLu {
    fn materialize<Op: JacOp<BorderedPair<DVector<f64>>>>(
        op: &Op,
        n: usize,
    ) -> (DMatrix<f64>, usize) {
        let total = n + 1;
        let mut mat = DMatrix::zeros(total, total);
        for j in 0..total {
            let mut e = BorderedPair::new(DVector::zeros(n), 0.0);
            if j < n {
                e.u[j] = 1.0;
            } else {
                e.p = 1.0;
            }
            let col = op.apply(&e);
            for i in 0..n {
                mat[(i, j)] = col.u[i];
            }
            mat[(n, j)] = col.p;
        }
        (mat, total)
    }

    fn solve_mat(
        mat: &DMatrix<f64>,
        rhs: &BorderedPair<DVector<f64>>,
    ) -> palc_core::Result<LinearSolve<BorderedPair<DVector<f64>>>> {
        let n = rhs.u.nrows();
        let mut b = DVector::zeros(n + 1);
        for i in 0..n {
            b[i] = rhs.u[i];
        }
        b[n] = rhs.p;
        let sol = DenseLu.solve(mat, &b)?.x;
        Ok(LinearSolve::direct(BorderedPair::new(
            sol.rows(0, n).into_owned(),
            sol[n],
        )))
    }
}

impl<Op: JacOp<BorderedPair<DVector<f64>>>> LinearSolver<BorderedPair<DVector<f64>>, Op>
    for BasisLu
{
    fn solve(
        &self,
        op: &Op,
        rhs: &BorderedPair<DVector<f64>>,
    ) -> palc_core::Result<LinearSolve<BorderedPair<DVector<f64>>>> {
        let (mat, _) = Self::materialize(op, rhs.u.nrows());
        Self::solve_mat(&mat, rhs)
    }

    fn solve_shifted(
        &self,
        op: &Op,
        a0: f64,
        a1: f64,
        rhs: &BorderedPair<DVector<f64>>,
    ) -> palc_core::Result<LinearSolve<BorderedPair<DVector<f64>>>> {
        let (mut mat, total) = Self::materialize(op, rhs.u.nrows());
        mat *= a1;
        for i in 0..total {
            mat[(i, i)] += a0;
        }
        Self::solve_mat(&mat, rhs)
    }
}

/// The matrix-free bordered strategy traces the same scalar fold branch.
#[test]
fn matrix_free_bordered_solver() {
    let field = cubic_field();
    let bls: MatrixFreeBls<BasisLu> = MatrixFreeBls::new(BasisLu);

    let params = ContinuationParams {
        ds: -0.01,
        ds_max: 0.02,
        p_min: 0.2,
        p_max: 1.5,
        max_steps: 80,
        detect_fold: false,
        ..ContinuationParams::default()
    };

    let x0 = DVector::from_vec(vec![0.8]);
    let it = ContIterator::new(&field, &bls, x0, 1.0, params, Predictor::Secant)
        .unwrap()
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none(), "failure: {:?}", out.failure);
    assert!(out.record.points.len() > 10);
    // Branch reaches the lower parameter boundary without folds in range.
    assert_eq!(out.record.stop, Some(StopReason::BoundaryReached));
    let f = field.eval(&out.last.u, out.last.p).unwrap();
    assert!(f[0].abs() < 1e-8);
}

/// Shooting continuation through a fold of cycles, with Floquet
/// bookkeeping and the `φ^T(x) ≈ x` property at every confirmed cycle.
#[test]
fn shooting_cycle_fold() {
    use palc_core::flow::Flow;
    use palc_core::periodic::{floquet, ShootingProblem};

    // Radial dynamics r' = r(p + r² − r⁴): two cycle families for
    // p ∈ (−1/4, 0) that collide in a fold of cycles at p = −1/4.
    fn rhs(p: f64, x: &[f64], out: &mut [f64]) {
        let r2 = x[0] * x[0] + x[1] * x[1];
        let g = p + r2 - r2 * r2;
        out[0] = -x[1] + x[0] * g;
        out[1] = x[0] + x[1] * g;
    }

    let flow = Flow::new(rhs as fn(f64, &[f64], &mut [f64]), 2).with_steps(200);
    let problem = ShootingProblem::new(flow, 1, |x: &DVector<f64>| x[1]);
    let eig = DenseEigen::default();
    let bls = BorderingBls::new(DenseLu);

    let p0 = -0.1;
    let r0 = ((1.0 + (1.0_f64 + 4.0 * p0).sqrt()) / 2.0).sqrt();
    let y0 = DVector::from_vec(vec![r0, 0.0, std::f64::consts::TAU]);

    let params = ContinuationParams {
        ds: -0.01,
        ds_min: 1e-4,
        ds_max: 0.02,
        p_min: -0.5,
        p_max: -0.005,
        max_steps: 120,
        detect_fold: true,
        detect_bifurcation: 1,
        compute_eigenvalues: true,
        nev: 2,
        precision_stability: 1e-3,
        save_sol_every: 1,
        newton: NewtonParams {
            tol: 1e-8,
            max_iter: 20,
            ..NewtonParams::default()
        },
        ..ContinuationParams::default()
    };

    let spectrum = floquet::shooting_floquet_spectrum(&problem, &eig);
    let it = ContIterator::new(&problem, &bls, y0, p0, params, Predictor::Secant)
        .unwrap()
        .with_spectrum(spectrum, StabilityRule::Modulus)
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none(), "failure: {:?}", out.failure);

    // The fold of cycles at p = −1/4 is flagged by the parameter turning.
    assert!(!out.record.foldpoints.is_empty());
    let fold = &out.record.foldpoints[0];
    assert!((fold.param + 0.25).abs() < 1e-3, "fold at p = {}", fold.param);

    // And the Floquet crossing through +1 is classified as a cycle fold.
    assert!(out
        .record
        .bifpoints
        .iter()
        .any(|b| b.kind == BifurcationKind::Fold));

    // Every confirmed cycle closes up under the flow.
    assert!(!out.record.solutions.is_empty());
    for sol in &out.record.solutions {
        assert!(
            problem.cycle_defect(&sol.u, sol.p) < 1e-5,
            "open orbit at p = {}",
            sol.p
        );
    }
}

/// The finalise hook cancels the run cooperatively.
#[test]
fn finalise_hook_aborts() {
    let field = cubic_field();
    let bls = BorderingBls::new(DenseLu);

    let params = ContinuationParams {
        ds: -0.01,
        max_steps: 100,
        detect_fold: false,
        ..ContinuationParams::default()
    };

    let hooks = Hooks {
        finalise: Some(Box::new(|state: &palc_core::IterState<DVector<f64>>| {
            state.step < 5
        })),
        ..Hooks::default()
    };

    let x0 = DVector::from_vec(vec![0.8]);
    let it = ContIterator::new(&field, &bls, x0, 1.0, params, Predictor::Secant)
        .unwrap()
        .with_hooks(hooks)
        .with_verbosity(0);
    let out = it.run();
    assert!(out.failure.is_none());
    assert_eq!(out.record.stop, Some(StopReason::UserAbort));
    assert_eq!(out.record.points.len(), 6);
}
