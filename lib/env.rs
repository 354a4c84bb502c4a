//! Fixed-point environments of triangular (Jordan-block) transfer operators.
//!
//! Given a block-upper-triangular MPO and a uniform MPS background, the left
//! (right) environment is the boundary tensor satisfying `GL·T = λ·GL` up to
//! an additive component in the diverging identity channel, which is removed
//! by explicit projection onto the background's transfer fixed point.
//!
//! The internal bond index is swept one scalar channel at a time, increasing
//! for the left sweep and decreasing for the right, and every channel is fully
//! resolved before any channel depending on it, so the sweep order is strict.
//! Per channel, the diagonal of the whole-cell operator decides the move:
//! a structurally zero diagonal copies the right-hand side, the identity
//! diagonal extracts the generalized eigenvalue and solves the projected
//! system, and a generic contracting diagonal solves `(1 - T)x = rhs`
//! directly. All solves go through [`crate::solve::linsolve`] on the flat
//! vectors of [`crate::linop`].
//!
//! The two sweeps produce independent eigenvalue estimates; disagreement
//! beyond the configured relative tolerance is a logged warning, and the
//! returned eigenvalue is their average.

use ndarray as nd;
use num_complex::Complex64 as C64;
use thiserror::Error;
use crate::block::Block;
use crate::krylov::Flag;
use crate::mpo::{
    ChannelKind,
    JordanMpo,
    UniformMps,
    pair,
    transfer_left_op,
    transfer_right_op,
};
use crate::solve::{ self, EigConfig, SolveConfig };
use crate::sparse::{ SparseError, SparseTensor };

#[derive(Debug, Error)]
pub enum EnvError {
    /// Returned when operator and background disagree on the unit-cell
    /// length.
    #[error("error in environment setup: MPO period {0} does not match MPS period {1}")]
    PeriodMismatch(usize, usize),

    /// Returned when operator and background disagree on a physical
    /// dimension.
    #[error("error in environment setup: physical dimension mismatch at site {0} (MPO {1}, MPS {2})")]
    PhysDimMismatch(usize, usize, usize),

    #[error(transparent)]
    Sparse(#[from] SparseError),
}
use EnvError::*;
pub type EnvResult<T> = Result<T, EnvError>;

/// Configuration for the environment sweeps.
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Per-channel linear-solve configuration.
    pub solve: SolveConfig,
    /// Configuration for the background fixed-point eigensolves.
    pub eig: EigConfig,
    /// Relative tolerance for the left/right eigenvalue cross-check;
    /// machine epsilon^(1/3) if unset.
    pub agreement_tol: Option<f64>,
}

/// The default left/right eigenvalue agreement tolerance.
pub fn default_agreement_tol() -> f64 { f64::EPSILON.powf(1.0 / 3.0) }

/// One sweep's output.
#[derive(Clone, Debug)]
pub struct Environment {
    /// Per-site boundary containers of shape `[1, N, 1]`, one rank-3 block
    /// per internal channel.
    pub tensors: Vec<SparseTensor<Block>>,
    /// The eigenvalue accumulated in the identity channel over one unit
    /// cell.
    pub lambda: C64,
    /// The worst convergence flag over the channel solves and fixed-point
    /// eigensolves.
    pub flag: Flag,
}

fn merge_flag(a: Flag, b: Flag) -> Flag {
    if a.converged() { b } else { a }
}

fn validate(mpo: &JordanMpo, mps: &UniformMps) -> EnvResult<()> {
    if mpo.period() != mps.period() {
        return Err(PeriodMismatch(mpo.period(), mps.period()));
    }
    for w in 0..mpo.period() {
        let dm = mpo.phys_dim(w);
        if dm != 0 && dm != mps.phys_dim(w) {
            return Err(PhysDimMismatch(w, dm, mps.phys_dim(w)));
        }
    }
    Ok(())
}

// channel blocks at one site -> the [1, N, 1] boundary container
fn to_container(ch: &[Option<nd::Array2<C64>>], nb: usize)
    -> EnvResult<SparseTensor<Block>>
{
    let mut t: SparseTensor<Block> = SparseTensor::new(vec![1, nb, 1]);
    for (i, slot) in ch.iter().enumerate().skip(1) {
        if let Some(m) = slot {
            let leg = m.clone().insert_axis(nd::Axis(1)).into_dyn();
            t.insert(vec![1, i, 1], Block(leg))?;
        }
    }
    Ok(t)
}

// rhs for the left sweep at channel i: every already-solved channel j < i
// propagated through the whole unit cell into channel i, the pure-diagonal
// path excluded
fn left_rhs(
    mpo: &JordanMpo,
    mps: &UniformMps,
    ch: &[Option<nd::Array2<C64>>],
    i: usize,
) -> nd::Array2<C64>
{
    let nb = mpo.bond_dim();
    let mut cur: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
    cur[..i].clone_from_slice(&ch[..i]);
    cur[0] = None;
    for w in 0..mpo.period() {
        let a_w = mps.tensor(w);
        let mut next: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
        for b in 1..=i {
            let mut acc: Option<nd::Array2<C64>> = None;
            for a in 1..=b {
                let Some(x) = cur[a].as_ref() else { continue };
                let Some(o) = mpo.entry(w, a, b) else { continue };
                let t = transfer_left_op(x, Some(&o), a_w);
                acc = Some(match acc { Some(s) => s + t, None => t });
            }
            next[b] = acc;
        }
        cur = next;
    }
    let d0 = mps.bond_dim(0);
    cur[i].take().unwrap_or_else(|| nd::Array2::zeros((d0, d0)))
}

// rhs for the right sweep at channel i: every already-solved channel j > i
// propagated backwards through the whole unit cell into channel i
fn right_rhs(
    mpo: &JordanMpo,
    mps: &UniformMps,
    ch: &[Option<nd::Array2<C64>>],
    i: usize,
) -> nd::Array2<C64>
{
    let nb = mpo.bond_dim();
    let mut cur: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
    cur[i + 1..].clone_from_slice(&ch[i + 1..]);
    for w in (0..mpo.period()).rev() {
        let a_w = mps.tensor(w);
        let mut next: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
        for a in i..=nb {
            let mut acc: Option<nd::Array2<C64>> = None;
            for b in a..=nb {
                let Some(x) = cur[b].as_ref() else { continue };
                let Some(o) = mpo.entry(w, a, b) else { continue };
                let t = transfer_right_op(x, Some(&o), a_w);
                acc = Some(match acc { Some(s) => s + t, None => t });
            }
            next[a] = acc;
        }
        cur = next;
    }
    let d0 = mps.bond_dim(0);
    cur[i].take().unwrap_or_else(|| nd::Array2::zeros((d0, d0)))
}

/// Compute the left fixed-point environment of `mpo` over the (assumed
/// left-orthonormal) background `mps`.
pub fn left_environment(
    mpo: &JordanMpo,
    mps: &UniformMps,
    cfg: &EnvConfig,
) -> EnvResult<Environment>
{
    validate(mpo, mps)?;
    let p = mpo.period();
    let nb = mpo.bond_dim();
    let d0 = mps.bond_dim(0);
    let eye: nd::Array2<C64> = nd::Array2::eye(d0);
    let (_, rho, mut flag) = mps.right_fixed_point(&cfg.eig);
    let mut lambda = C64::new(0.0, 0.0);
    let mut ch: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
    for i in 1..=nb {
        let rhs = left_rhs(mpo, mps, &ch, i);
        let diags: Vec<Option<nd::Array2<C64>>> =
            (0..p).map(|w| mpo.entry(w, i, i)).collect();
        let cell_diag = |x: &nd::Array2<C64>| -> nd::Array2<C64> {
            (0..p).fold(x.clone(), |acc, w| {
                transfer_left_op(&acc, diags[w].as_ref(), mps.tensor(w))
            })
        };
        match mpo.diagonal_kind(i) {
            ChannelKind::Zero => { ch[i] = Some(rhs); },
            ChannelKind::Identity if i == 1 => {
                // the sweep's entry channel has no dependencies; it is the
                // boundary condition itself, the transfer fixed point
                ch[i] = Some(eye.clone());
            },
            ChannelKind::Identity => {
                let e = pair(&rhs, &rho);
                lambda += e;
                // remove the divergent direction, solve the projected
                // system, then force exact orthogonality back in
                let rhs_reg = &rhs - &eye.mapv(|z| z * e);
                let op = |x: &nd::Array2<C64>| -> nd::Array2<C64> {
                    let proj = pair(x, &rho);
                    &(x - &cell_diag(x)) + &eye.mapv(|z| z * proj)
                };
                let out = solve::linsolve(
                    &op, &rhs_reg, None, None, None, &cfg.solve);
                flag = merge_flag(flag, out.flag);
                let coeff = pair(&out.x, &rho);
                ch[i] = Some(&out.x - &eye.mapv(|z| z * coeff));
            },
            ChannelKind::Generic => {
                let op = |x: &nd::Array2<C64>| -> nd::Array2<C64> {
                    x - &cell_diag(x)
                };
                let out = solve::linsolve(
                    &op, &rhs, None, None, None, &cfg.solve);
                flag = merge_flag(flag, out.flag);
                ch[i] = Some(out.x);
            },
        }
    }
    // advance around the unit cell, one site's transfer slice at a time
    let mut tensors: Vec<SparseTensor<Block>> = Vec::with_capacity(p);
    tensors.push(to_container(&ch, nb)?);
    let mut site_ch = ch;
    for w in 0..p.saturating_sub(1) {
        let a_w = mps.tensor(w);
        let mut next: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
        for b in 1..=nb {
            let mut acc: Option<nd::Array2<C64>> = None;
            for a in 1..=b {
                let Some(x) = site_ch[a].as_ref() else { continue };
                let Some(o) = mpo.entry(w, a, b) else { continue };
                let t = transfer_left_op(x, Some(&o), a_w);
                acc = Some(match acc { Some(s) => s + t, None => t });
            }
            next[b] = acc;
        }
        site_ch = next;
        tensors.push(to_container(&site_ch, nb)?);
    }
    Ok(Environment { tensors, lambda, flag })
}

/// Compute the right fixed-point environment of `mpo` over the (assumed
/// right-orthonormal) background `mps`.
pub fn right_environment(
    mpo: &JordanMpo,
    mps: &UniformMps,
    cfg: &EnvConfig,
) -> EnvResult<Environment>
{
    validate(mpo, mps)?;
    let p = mpo.period();
    let nb = mpo.bond_dim();
    let d0 = mps.bond_dim(0);
    let eye: nd::Array2<C64> = nd::Array2::eye(d0);
    let (_, sigma, mut flag) = mps.left_fixed_point(&cfg.eig);
    let mut lambda = C64::new(0.0, 0.0);
    let mut ch: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
    for i in (1..=nb).rev() {
        let rhs = right_rhs(mpo, mps, &ch, i);
        let diags: Vec<Option<nd::Array2<C64>>> =
            (0..p).map(|w| mpo.entry(w, i, i)).collect();
        let cell_diag = |x: &nd::Array2<C64>| -> nd::Array2<C64> {
            (0..p).rev().fold(x.clone(), |acc, w| {
                transfer_right_op(&acc, diags[w].as_ref(), mps.tensor(w))
            })
        };
        match mpo.diagonal_kind(i) {
            ChannelKind::Zero => { ch[i] = Some(rhs); },
            ChannelKind::Identity if i == nb => {
                ch[i] = Some(eye.clone());
            },
            ChannelKind::Identity => {
                let e = pair(&sigma, &rhs);
                lambda += e;
                let rhs_reg = &rhs - &eye.mapv(|z| z * e);
                let op = |x: &nd::Array2<C64>| -> nd::Array2<C64> {
                    let proj = pair(&sigma, x);
                    &(x - &cell_diag(x)) + &eye.mapv(|z| z * proj)
                };
                let out = solve::linsolve(
                    &op, &rhs_reg, None, None, None, &cfg.solve);
                flag = merge_flag(flag, out.flag);
                let coeff = pair(&sigma, &out.x);
                ch[i] = Some(&out.x - &eye.mapv(|z| z * coeff));
            },
            ChannelKind::Generic => {
                let op = |x: &nd::Array2<C64>| -> nd::Array2<C64> {
                    x - &cell_diag(x)
                };
                let out = solve::linsolve(
                    &op, &rhs, None, None, None, &cfg.solve);
                flag = merge_flag(flag, out.flag);
                ch[i] = Some(out.x);
            },
        }
    }
    // advance around the unit cell in the mirror direction
    let mut tensors: Vec<SparseTensor<Block>> = vec![to_container(&ch, nb)?];
    let mut site_ch = ch;
    for w in (1..p).rev() {
        let a_w = mps.tensor(w);
        let mut next: Vec<Option<nd::Array2<C64>>> = vec![None; nb + 1];
        for a in 1..=nb {
            let mut acc: Option<nd::Array2<C64>> = None;
            for b in a..=nb {
                let Some(x) = site_ch[b].as_ref() else { continue };
                let Some(o) = mpo.entry(w, a, b) else { continue };
                let t = transfer_right_op(x, Some(&o), a_w);
                acc = Some(match acc { Some(s) => s + t, None => t });
            }
            next[a] = acc;
        }
        site_ch = next;
        tensors.insert(0, to_container(&site_ch, nb)?);
    }
    Ok(Environment { tensors, lambda, flag })
}

/// Compute both environments and cross-check their eigenvalue estimates.
///
/// `mps_left` must be left-orthonormal and `mps_right` right-orthonormal.
/// The two estimates must agree to the configured relative tolerance;
/// disagreement beyond it is reported as a warning, never a failure, and the
/// returned eigenvalue is their average.
pub fn environments(
    mpo: &JordanMpo,
    mps_left: &UniformMps,
    mps_right: &UniformMps,
    cfg: &EnvConfig,
) -> EnvResult<(Environment, Environment, C64)>
{
    let gl = left_environment(mpo, mps_left, cfg)?;
    let gr = right_environment(mpo, mps_right, cfg)?;
    let tol = cfg.agreement_tol.unwrap_or_else(default_agreement_tol);
    let scale = gl.lambda.norm().max(gr.lambda.norm()).max(1.0);
    if (gl.lambda - gr.lambda).norm() > tol * scale {
        log::warn!(
            "left/right environment eigenvalues disagree: {} vs {}",
            gl.lambda,
            gr.lambda,
        );
    }
    let avg = (gl.lambda + gr.lambda) * 0.5;
    Ok((gl, gr, avg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpo::JordanMpo;

    fn quiet() -> EnvConfig {
        EnvConfig {
            solve: SolveConfig {
                verbosity: 0,
                ..SolveConfig::default()
            },
            eig: EigConfig { verbosity: 0, ..EigConfig::default() },
            agreement_tol: None,
        }
    }

    fn product_up() -> UniformMps {
        let mut a: nd::Array3<C64> = nd::Array3::zeros((1, 2, 1));
        a[[0, 0, 0]] = C64::new(1.0, 0.0);
        UniformMps::new(vec![a]).unwrap()
    }

    fn product_plus() -> UniformMps {
        let r = C64::new(std::f64::consts::FRAC_1_SQRT_2, 0.0);
        let mut a: nd::Array3<C64> = nd::Array3::zeros((1, 2, 1));
        a[[0, 0, 0]] = r;
        a[[0, 1, 0]] = r;
        UniformMps::new(vec![a]).unwrap()
    }

    #[test]
    fn ising_energy_in_up_state() {
        // <up| (-J Z Z - h X) |up> per site = -J
        let mpo = JordanMpo::ising(0.7, 0.3);
        let mps = product_up();
        let gl = left_environment(&mpo, &mps, &quiet()).unwrap();
        assert_eq!(gl.flag.code(), 0);
        assert!((gl.lambda - C64::new(-0.7, 0.0)).norm() < 1e-10,
            "lambda = {}", gl.lambda);
        // entry channel is the seed, coupling channel carries <Z> = 1
        let t0 = &gl.tensors[0];
        let seed = t0.get(&[1, 1, 1]).unwrap().as3().unwrap();
        assert!((seed[[0, 0, 0]] - C64::new(1.0, 0.0)).norm() < 1e-12);
        let coupling = t0.get(&[1, 2, 1]).unwrap().as3().unwrap();
        assert!((coupling[[0, 0, 0]] - C64::new(1.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn ising_energy_in_plus_state() {
        // <+| (-J Z Z - h X) |+> per site = -h
        let mpo = JordanMpo::ising(0.7, 0.3);
        let mps = product_plus();
        let gl = left_environment(&mpo, &mps, &quiet()).unwrap();
        assert!((gl.lambda - C64::new(-0.3, 0.0)).norm() < 1e-10,
            "lambda = {}", gl.lambda);
    }

    #[test]
    fn right_sweep_mirrors_left() {
        let mpo = JordanMpo::ising(1.1, 0.4);
        let mps = product_up();
        let (gl, gr, avg) = environments(&mpo, &mps, &mps, &quiet()).unwrap();
        assert!((gl.lambda - gr.lambda).norm() < 1e-10);
        assert!((avg - C64::new(-1.1, 0.0)).norm() < 1e-10);
    }

    #[test]
    fn accumulator_channel_is_projected_out() {
        let mpo = JordanMpo::ising(0.9, 0.2);
        let mps = product_up();
        let cfg = quiet();
        let (_, rho, _) = mps.right_fixed_point(&cfg.eig);
        let gl = left_environment(&mpo, &mps, &cfg).unwrap();
        let acc = gl.tensors[0].get(&[1, 3, 1]).unwrap().as3().unwrap();
        let mat = acc.index_axis(nd::Axis(1), 0).to_owned();
        assert!(pair(&mat, &rho).norm() < 1e-10);
    }

    #[test]
    fn rejects_period_mismatch() {
        let mpo = JordanMpo::ising(1.0, 1.0);
        let a = product_up();
        let two = UniformMps::new(vec![
            a.tensor(0).clone(),
            a.tensor(0).clone(),
        ]).unwrap();
        assert!(matches!(
            left_environment(&mpo, &two, &quiet()),
            Err(PeriodMismatch(1, 2)),
        ));
    }
}
