//! End-to-end acceptance scenario for the triangular environment solver.
//!
//! # Test Methodology
//!
//! The transverse-field Ising chain `H = -J Σ Z_i Z_{i+1} - h Σ X_i` has a
//! 3-channel Jordan MPO (identity, coupling, identity-accumulator), and for a
//! product-state background the energy density is known in closed form:
//! `e = -J <Z>² - h <X>`. The environment sweeps must reproduce that value
//! through the full machinery: triangular channel ordering, the structurally
//! zero coupling channel, and the projected solve in the identity-accumulator
//! channel.
//!
//! A second scenario runs on a bond-dimension-2 left-orthonormal background,
//! where the identity-channel solve is a genuine iterative Krylov solve. The
//! ground truth there is the energy density evaluated by direct transfer
//! contraction against the background's dominant fixed point.

use approx::assert_abs_diff_eq;
use ndarray as nd;
use ndarray_linalg::QR;
use num_complex::Complex64 as C64;
use transfer_net::env::{ self, EnvConfig };
use transfer_net::mpo::{
    self,
    JordanMpo,
    UniformMps,
    SIGMA_X,
    SIGMA_Z,
};
use transfer_net::solve::{ Algorithm, EigConfig, SolveConfig };

const ACCEPT_TOL: f64 = 1e-5;

fn quiet() -> EnvConfig {
    EnvConfig {
        solve: SolveConfig { verbosity: 0, ..SolveConfig::default() },
        eig: EigConfig { verbosity: 0, ..EigConfig::default() },
        agreement_tol: None,
    }
}

// a bond-dimension-1 product state at polar angle theta on the Bloch sphere
fn product_state(theta: f64) -> UniformMps {
    let mut a: nd::Array3<C64> = nd::Array3::zeros((1, 2, 1));
    a[[0, 0, 0]] = C64::new((theta / 2.0).cos(), 0.0);
    a[[0, 1, 0]] = C64::new((theta / 2.0).sin(), 0.0);
    UniformMps::new(vec![a]).unwrap()
}

#[test]
fn ising_product_state_energy() {
    let (j, h) = (1.0, 0.5);
    let mpo = JordanMpo::ising(j, h);
    for theta in [0.0, 0.4, 1.1, std::f64::consts::FRAC_PI_2] {
        let mps = product_state(theta);
        let (gl, gr, lambda) =
            env::environments(&mpo, &mps, &mps, &quiet()).unwrap();
        assert_eq!(gl.flag.code(), 0);
        assert_eq!(gr.flag.code(), 0);
        let z = theta.cos();
        let x = theta.sin();
        let exact = -j * z * z - h * x;
        assert_abs_diff_eq!(lambda.re, exact, epsilon = ACCEPT_TOL);
        assert_abs_diff_eq!(lambda.im, 0.0, epsilon = ACCEPT_TOL);
    }
}

#[test]
fn left_and_right_sweeps_agree() {
    let mpo = JordanMpo::ising(0.8, 1.3);
    let mps = product_state(0.7);
    let (gl, gr, _) = env::environments(&mpo, &mps, &mps, &quiet()).unwrap();
    assert!((gl.lambda - gr.lambda).norm() < 1e-10);
}

// a deterministic left-orthonormal bond-dimension-2 site tensor
fn entangled_background() -> UniformMps {
    let m = nd::Array2::from_shape_fn((4, 2), |(i, k)| {
        C64::new(
            (0.7 * (i as f64 + 1.0) + 0.3 * k as f64).sin(),
            (1.3 * (i as f64) - 0.5 * (k as f64 + 1.0)).cos(),
        )
    });
    let (q, _) = m.qr().unwrap();
    let a = q.into_shape((2, 2, 2)).unwrap();
    UniformMps::new(vec![a]).unwrap()
}

#[test]
fn entangled_background_energy_matches_direct_contraction() {
    let (j, h) = (0.9, 0.6);
    let mpo = JordanMpo::ising(j, h);
    let mps = entangled_background();

    // ground truth by direct transfer contraction against the fixed point
    let cfg = quiet();
    let (_, rho, flag) = mps.right_fixed_point(&cfg.eig);
    assert_eq!(flag.code(), 0);
    let eye: nd::Array2<C64> = nd::Array2::eye(2);
    let zj = SIGMA_Z.mapv(|v| v * (-j));
    let xh = SIGMA_X.mapv(|v| v * (-h));
    let z1 = mpo::transfer_left_op(&eye, Some(&SIGMA_Z), mps.tensor(0));
    let zz = mpo::transfer_left_op(&z1, Some(&zj), mps.tensor(0));
    let xx = mpo::transfer_left_op(&eye, Some(&xh), mps.tensor(0));
    let direct = mpo::pair(&zz, &rho) + mpo::pair(&xx, &rho);

    let gl = env::left_environment(&mpo, &mps, &cfg).unwrap();
    assert_eq!(gl.flag.code(), 0);
    assert_abs_diff_eq!(gl.lambda.re, direct.re, epsilon = ACCEPT_TOL);
    assert_abs_diff_eq!(gl.lambda.im, direct.im, epsilon = ACCEPT_TOL);

    // the accumulator channel came out of a projected solve and must be
    // exactly orthogonal to the fixed point
    let acc = gl.tensors[0].get(&[1, 3, 1]).unwrap().as3().unwrap();
    let acc_mat = acc.index_axis(nd::Axis(1), 0).to_owned();
    assert!(mpo::pair(&acc_mat, &rho).norm() < 1e-9);
}

#[test]
fn channel_solves_work_with_every_backend() {
    // the per-channel systems are tiny, so every Krylov back-end must land
    // on the same energy
    let mpo = JordanMpo::ising(1.2, 0.3);
    let mps = entangled_background();
    let mut reference: Option<C64> = None;
    for algorithm in [
        Algorithm::Gmres,
        Algorithm::BiCgStab,
        Algorithm::BiCgStabL(2),
    ] {
        let cfg = EnvConfig {
            solve: SolveConfig {
                algorithm,
                verbosity: 0,
                ..SolveConfig::default()
            },
            eig: EigConfig { verbosity: 0, ..EigConfig::default() },
            agreement_tol: None,
        };
        let gl = env::left_environment(&mpo, &mps, &cfg).unwrap();
        assert_eq!(gl.flag.code(), 0, "{algorithm:?}");
        match reference {
            None => { reference = Some(gl.lambda); },
            Some(lam) => {
                assert!((gl.lambda - lam).norm() < 1e-8, "{algorithm:?}");
            },
        }
    }
}
