//! Matrix-free Krylov back-ends on flat complex vectors.
//!
//! Every solver here consumes an operator as a plain function on
//! [`nd::Array1`] vectors (produced in practice by
//! [`crate::linop::flatten_op`]), together with a tolerance, an iteration
//! cap, an optional preconditioner, and an initial guess, and returns its
//! best solution alongside a numeric [`Flag`]. Convergence failures are
//! reported through the flag, never raised.
//!
//! Linear solvers: restarted GMRES with Givens rotations, BiCGStab,
//! BiCGStab(ℓ), and preconditioned CG. Eigensolver: explicitly restarted
//! Arnoldi, with a Hermitian Ritz-extraction path. The small projected
//! systems (Hessenberg eigenproblem, the BiCGStab(ℓ) polynomial step) are
//! handed to LAPACK through `ndarray-linalg`.

use std::fmt;
use std::ops::Add;
use ndarray as nd;
use ndarray_linalg::{ Eig, Eigh, Solve, UPLO };
use num_complex::ComplexFloat;
use num_traits::{ Float, One, Zero };
use rand::{
    Rng,
    distributions::{ Distribution, Standard },
};
use crate::{ ComplexFloatExt, ComplexScalar };

/// A flat-vector operator.
pub type FlatOp<'a, A> = &'a dyn Fn(&nd::Array1<A>) -> nd::Array1<A>;

/// Numeric convergence flag shared by every back-end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flag {
    /// The requested tolerance was reached.
    Converged,
    /// The iteration cap was exhausted first.
    MaxIter,
    /// The preconditioner produced non-finite output.
    BadPrecond,
    /// The iteration stopped making progress (breakdown or stagnation).
    Stagnated,
    /// A non-finite intermediate scalar appeared.
    ScalarOverflow,
}

impl Flag {
    /// The numeric code: 0 converged, 1 max-iterations, 2 ill-conditioned
    /// preconditioner, 3 stagnated, 4 overflow/underflow.
    pub fn code(self) -> u8 {
        match self {
            Self::Converged => 0,
            Self::MaxIter => 1,
            Self::BadPrecond => 2,
            Self::Stagnated => 3,
            Self::ScalarOverflow => 4,
        }
    }

    pub fn converged(self) -> bool { matches!(self, Self::Converged) }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::MaxIter => write!(f, "maximum iterations exceeded"),
            Self::BadPrecond => write!(f, "ill-conditioned preconditioner"),
            Self::Stagnated => write!(f, "stagnated"),
            Self::ScalarOverflow =>
                write!(f, "overflow or underflow in an intermediate scalar"),
        }
    }
}

/// Solution of a linear solve, with its convergence report.
#[derive(Clone, Debug)]
pub struct LinOutcome<A>
where A: ComplexScalar
{
    pub x: nd::Array1<A>,
    pub flag: Flag,
    pub iterations: usize,
    /// Relative residual at exit.
    pub residual: A::Re,
}

/// Eigenpairs found by the eigensolver, with its convergence report.
#[derive(Clone, Debug)]
pub struct EigOutcome<A>
where A: ComplexScalar
{
    pub values: Vec<A>,
    pub vectors: Vec<nd::Array1<A>>,
    pub flag: Flag,
    pub iterations: usize,
}

/// Eigenpair selector.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Which<A> {
    LargestAbs,
    SmallestAbs,
    LargestReal,
    SmallestReal,
    BothEndsReal,
    LargestImag,
    SmallestImag,
    BothEndsImag,
    /// Nearest a numeric shift.
    Shift(A),
}

fn dotc<A>(a: &nd::Array1<A>, b: &nd::Array1<A>) -> A
where A: ComplexScalar
{
    a.iter().zip(b)
        .map(|(ai, bi)| ComplexFloat::conj(*ai) * *bi)
        .fold(A::zero(), |acc, z| acc + z)
}

fn nrm2<A>(a: &nd::Array1<A>) -> A::Re
where A: ComplexScalar
{
    Float::sqrt(
        a.iter()
            .map(|ai| Float::powi(ComplexFloat::abs(*ai), 2))
            .fold(A::Re::zero(), A::Re::add)
    )
}

fn finite<A>(z: A) -> bool
where A: ComplexScalar
{
    Float::is_finite(ComplexFloat::re(z))
        && Float::is_finite(ComplexFloat::im(z))
}

fn all_finite<A>(v: &nd::Array1<A>) -> bool
where A: ComplexScalar
{
    v.iter().all(|&z| finite(z))
}

// y <- y + alpha x
fn axpy<A>(alpha: A, x: &nd::Array1<A>, y: &mut nd::Array1<A>)
where A: ComplexScalar
{
    y.zip_mut_with(x, |yi, xi| { *yi = *yi + alpha * *xi; });
}

fn scaled<A>(x: &nd::Array1<A>, alpha: A) -> nd::Array1<A>
where A: ComplexScalar
{
    x.mapv(|xi| xi * alpha)
}

fn apply_precond<A>(
    m: Option<FlatOp<A>>,
    v: &nd::Array1<A>,
) -> Result<nd::Array1<A>, Flag>
where A: ComplexScalar
{
    match m {
        None => Ok(v.clone()),
        Some(m) => {
            let w = m(v);
            if all_finite(&w) { Ok(w) } else { Err(Flag::BadPrecond) }
        },
    }
}

/// Complex Givens rotation annihilating `b` against `a`.
fn givens<A>(a: A, b: A) -> (A, A)
where A: ComplexScalar
{
    if b == A::zero() {
        (A::one(), A::zero())
    } else if a == A::zero() {
        (A::zero(), A::one())
    } else {
        let abs_a = ComplexFloat::abs(a);
        let r = Float::sqrt(
            Float::powi(abs_a, 2) + Float::powi(ComplexFloat::abs(b), 2));
        let c = A::from_re(abs_a / r);
        let s = (a / A::from_re(abs_a)) * ComplexFloat::conj(b)
            * A::from_re(A::Re::one() / r);
        (c, s)
    }
}

/// Solve `A(x) = b` by restarted GMRES with modified Gram-Schmidt and Givens
/// rotations, optionally left-preconditioned by `m`.
pub fn gmres<A>(
    op: FlatOp<A>,
    b: &nd::Array1<A>,
    x0: Option<&nd::Array1<A>>,
    m: Option<FlatOp<A>>,
    tol: A::Re,
    maxiter: usize,
    restart: usize,
) -> LinOutcome<A>
where A: ComplexScalar
{
    let n = b.len();
    let zero_x = nd::Array1::zeros(n);
    let mb = match apply_precond(m, b) {
        Ok(v) => v,
        Err(flag) => return LinOutcome {
            x: zero_x, flag, iterations: 0, residual: A::Re::infinity() },
    };
    let b_norm = nrm2(&mb);
    if b_norm == A::Re::zero() {
        return LinOutcome {
            x: zero_x,
            flag: Flag::Converged,
            iterations: 0,
            residual: A::Re::zero(),
        };
    }
    let apply = |v: &nd::Array1<A>| -> Result<nd::Array1<A>, Flag> {
        let w = op(v);
        if !all_finite(&w) { return Err(Flag::ScalarOverflow); }
        apply_precond(m, &w)
    };
    let mut x: nd::Array1<A> = x0.cloned().unwrap_or(zero_x);
    let mm = restart.max(1).min(n);
    let mut total_iter: usize = 0;
    let mut last_rel = A::Re::infinity();
    loop {
        let ax = match apply(&x) {
            Ok(v) => v,
            Err(flag) => return LinOutcome {
                x, flag, iterations: total_iter,
                residual: A::Re::infinity() },
        };
        let mut r = &mb - &ax;
        let r_norm = nrm2(&r);
        let rel = r_norm / b_norm;
        if rel <= tol {
            return LinOutcome {
                x, flag: Flag::Converged,
                iterations: total_iter, residual: rel };
        }
        if total_iter >= maxiter {
            return LinOutcome {
                x, flag: Flag::MaxIter,
                iterations: total_iter, residual: rel };
        }
        if Float::is_finite(last_rel)
            && last_rel - rel <= A::Re::epsilon() * last_rel
        {
            return LinOutcome {
                x, flag: Flag::Stagnated,
                iterations: total_iter, residual: rel };
        }
        last_rel = rel;

        // Arnoldi cycle
        let mut v: Vec<nd::Array1<A>> = Vec::with_capacity(mm + 1);
        let mut h: nd::Array2<A> = nd::Array2::zeros((mm + 1, mm));
        let mut cs: Vec<A> = vec![A::zero(); mm];
        let mut sn: Vec<A> = vec![A::zero(); mm];
        let mut g: Vec<A> = vec![A::zero(); mm + 1];
        g[0] = A::from_re(r_norm);
        r.mapv_inplace(|ri| ri * A::from_re(A::Re::one() / r_norm));
        v.push(r);

        let mut k = 0;
        while k < mm && total_iter < maxiter {
            total_iter += 1;
            let mut w = match apply(&v[k]) {
                Ok(w) => w,
                Err(flag) => return LinOutcome {
                    x, flag, iterations: total_iter, residual: rel },
            };
            for j in 0..=k {
                let hjk = dotc(&v[j], &w);
                h[[j, k]] = hjk;
                axpy(-hjk, &v[j], &mut w);
            }
            let w_norm = nrm2(&w);
            h[[k + 1, k]] = A::from_re(w_norm);
            let lucky = w_norm <= A::Re::epsilon() * b_norm;
            if !lucky {
                v.push(scaled(&w, A::from_re(A::Re::one() / w_norm)));
            }

            // rotation convention: c real, G = [[c, s], [-conj(s), c]]
            for j in 0..k {
                let tmp = cs[j] * h[[j, k]] + sn[j] * h[[j + 1, k]];
                h[[j + 1, k]] = -ComplexFloat::conj(sn[j]) * h[[j, k]]
                    + cs[j] * h[[j + 1, k]];
                h[[j, k]] = tmp;
            }
            let (c, s) = givens(h[[k, k]], h[[k + 1, k]]);
            cs[k] = c;
            sn[k] = s;
            h[[k, k]] = c * h[[k, k]] + s * h[[k + 1, k]];
            h[[k + 1, k]] = A::zero();
            let tmp = c * g[k];
            g[k + 1] = -ComplexFloat::conj(s) * g[k];
            g[k] = tmp;

            k += 1;
            if lucky
                || ComplexFloat::abs(g[k]) / b_norm <= tol
            {
                break;
            }
        }

        // back-substitute H y = g and update x along the basis
        let mut y: Vec<A> = vec![A::zero(); k];
        for i in (0..k).rev() {
            let mut sum = g[i];
            for (j, yj) in y.iter().enumerate().take(k).skip(i + 1) {
                sum = sum - h[[i, j]] * *yj;
            }
            if ComplexFloat::abs(h[[i, i]]) > A::Re::zero() {
                y[i] = sum / h[[i, i]];
            }
        }
        for (vi, yi) in v.iter().zip(&y) {
            axpy(*yi, vi, &mut x);
        }
    }
}

/// Solve `A(x) = b` by BiCGStab, optionally right-preconditioned by `m`.
pub fn bicgstab<A>(
    op: FlatOp<A>,
    b: &nd::Array1<A>,
    x0: Option<&nd::Array1<A>>,
    m: Option<FlatOp<A>>,
    tol: A::Re,
    maxiter: usize,
) -> LinOutcome<A>
where A: ComplexScalar
{
    let n = b.len();
    let b_norm = nrm2(b);
    let mut x: nd::Array1<A> =
        x0.cloned().unwrap_or_else(|| nd::Array1::zeros(n));
    if b_norm == A::Re::zero() {
        return LinOutcome {
            x: nd::Array1::zeros(n),
            flag: Flag::Converged,
            iterations: 0,
            residual: A::Re::zero(),
        };
    }
    let mut r = b - &op(&x);
    let r_hat = r.clone();
    let mut rho = A::one();
    let mut alpha = A::one();
    let mut omega = A::one();
    let mut vv: nd::Array1<A> = nd::Array1::zeros(n);
    let mut p: nd::Array1<A> = nd::Array1::zeros(n);
    let mut rel = nrm2(&r) / b_norm;
    let finish = |x, flag, it, rel| LinOutcome {
        x, flag, iterations: it, residual: rel };
    if rel <= tol { return finish(x, Flag::Converged, 0, rel); }
    for it in 1..=maxiter {
        let rho_new = dotc(&r_hat, &r);
        if !finite(rho_new) {
            return finish(x, Flag::ScalarOverflow, it, rel);
        }
        if rho_new == A::zero() {
            return finish(x, Flag::Stagnated, it, rel);
        }
        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;
        // p = r + beta (p - omega v)
        p.zip_mut_with(&vv, |pi, vi| { *pi = *pi - omega * *vi; });
        p.mapv_inplace(|pi| pi * beta);
        p.zip_mut_with(&r, |pi, ri| { *pi = *pi + *ri; });
        let p_hat = match apply_precond(m, &p) {
            Ok(v) => v,
            Err(flag) => return finish(x, flag, it, rel),
        };
        vv = op(&p_hat);
        let denom = dotc(&r_hat, &vv);
        if denom == A::zero() {
            return finish(x, Flag::Stagnated, it, rel);
        }
        alpha = rho / denom;
        if !finite(alpha) {
            return finish(x, Flag::ScalarOverflow, it, rel);
        }
        let mut s = r.clone();
        axpy(-alpha, &vv, &mut s);
        let s_rel = nrm2(&s) / b_norm;
        if s_rel <= tol {
            axpy(alpha, &p_hat, &mut x);
            return finish(x, Flag::Converged, it, s_rel);
        }
        let s_hat = match apply_precond(m, &s) {
            Ok(v) => v,
            Err(flag) => return finish(x, flag, it, rel),
        };
        let t = op(&s_hat);
        let tt = dotc(&t, &t);
        if tt == A::zero() {
            return finish(x, Flag::Stagnated, it, s_rel);
        }
        omega = dotc(&t, &s) / tt;
        if !finite(omega) {
            return finish(x, Flag::ScalarOverflow, it, s_rel);
        }
        axpy(alpha, &p_hat, &mut x);
        axpy(omega, &s_hat, &mut x);
        r = s;
        axpy(-omega, &t, &mut r);
        rel = nrm2(&r) / b_norm;
        if rel <= tol {
            return finish(x, Flag::Converged, it, rel);
        }
    }
    LinOutcome { x, flag: Flag::MaxIter, iterations: maxiter, residual: rel }
}

/// Solve `A(x) = b` by BiCGStab(ℓ): `ell` BiCG sweeps followed by a degree-ℓ
/// minimal-residual polynomial step per cycle. `ell = 1` reduces to plain
/// BiCGStab. Preconditioning is applied from the left.
pub fn bicgstabl<A>(
    op: FlatOp<A>,
    b: &nd::Array1<A>,
    x0: Option<&nd::Array1<A>>,
    m: Option<FlatOp<A>>,
    ell: usize,
    tol: A::Re,
    maxiter: usize,
) -> LinOutcome<A>
where A: ComplexScalar
{
    let n = b.len();
    let ell = ell.max(1);
    let zero_x = nd::Array1::zeros(n);
    let mb = match apply_precond(m, b) {
        Ok(v) => v,
        Err(flag) => return LinOutcome {
            x: zero_x, flag, iterations: 0, residual: A::Re::infinity() },
    };
    let b_norm = nrm2(&mb);
    if b_norm == A::Re::zero() {
        return LinOutcome {
            x: zero_x,
            flag: Flag::Converged,
            iterations: 0,
            residual: A::Re::zero(),
        };
    }
    let apply = |v: &nd::Array1<A>| -> Result<nd::Array1<A>, Flag> {
        let w = op(v);
        if !all_finite(&w) { return Err(Flag::ScalarOverflow); }
        apply_precond(m, &w)
    };
    let mut x: nd::Array1<A> = x0.cloned().unwrap_or(zero_x);
    let ax = match apply(&x) {
        Ok(v) => v,
        Err(flag) => return LinOutcome {
            x, flag, iterations: 0, residual: A::Re::infinity() },
    };
    let mut rs: Vec<nd::Array1<A>> = vec![&mb - &ax];
    rs.resize(ell + 1, nd::Array1::zeros(n));
    let mut us: Vec<nd::Array1<A>> = vec![nd::Array1::zeros(n); ell + 1];
    let r_tilde = rs[0].clone();
    let mut rho0 = A::one();
    let mut alpha = A::zero();
    let mut omega = A::one();
    let mut it: usize = 0;
    let mut rel = nrm2(&rs[0]) / b_norm;
    if rel <= tol {
        return LinOutcome {
            x, flag: Flag::Converged, iterations: 0, residual: rel };
    }
    while it < maxiter {
        rho0 = -omega * rho0;
        // BiCG part
        for j in 0..ell {
            let rho1 = dotc(&r_tilde, &rs[j]);
            if rho0 == A::zero() || !finite(rho1) {
                let flag =
                    if finite(rho1) { Flag::Stagnated }
                    else { Flag::ScalarOverflow };
                return LinOutcome { x, flag, iterations: it, residual: rel };
            }
            let beta = alpha * (rho1 / rho0);
            rho0 = rho1;
            for i in 0..=j {
                let ui = scaled(&us[i], -beta);
                us[i] = &rs[i] + &ui;
            }
            us[j + 1] = match apply(&us[j]) {
                Ok(v) => v,
                Err(flag) => return LinOutcome {
                    x, flag, iterations: it, residual: rel },
            };
            it += 1;
            let gamma = dotc(&r_tilde, &us[j + 1]);
            if gamma == A::zero() {
                return LinOutcome {
                    x, flag: Flag::Stagnated, iterations: it, residual: rel };
            }
            alpha = rho0 / gamma;
            for i in 0..=j {
                let ui = us[i + 1].clone();
                axpy(-alpha, &ui, &mut rs[i]);
            }
            rs[j + 1] = match apply(&rs[j]) {
                Ok(v) => v,
                Err(flag) => return LinOutcome {
                    x, flag, iterations: it, residual: rel },
            };
            it += 1;
            axpy(alpha, &us[0].clone(), &mut x);
        }
        // minimal-residual polynomial part
        let mut z: nd::Array2<A> = nd::Array2::zeros((ell, ell));
        let mut y: nd::Array1<A> = nd::Array1::zeros(ell);
        for i in 0..ell {
            for j in 0..ell {
                z[[i, j]] = dotc(&rs[i + 1], &rs[j + 1]);
            }
            y[i] = dotc(&rs[i + 1], &rs[0]);
        }
        let gamma = match z.solve_into(y) {
            Ok(g) => g,
            Err(_) => return LinOutcome {
                x, flag: Flag::Stagnated, iterations: it, residual: rel },
        };
        omega = gamma[ell - 1];
        if omega == A::zero() || !finite(omega) {
            let flag =
                if finite(omega) { Flag::Stagnated }
                else { Flag::ScalarOverflow };
            return LinOutcome { x, flag, iterations: it, residual: rel };
        }
        for j in 0..ell {
            axpy(gamma[j], &rs[j].clone(), &mut x);
            let rj = rs[j + 1].clone();
            axpy(-gamma[j], &rj, &mut rs[0]);
            let uj = us[j + 1].clone();
            axpy(-gamma[j], &uj, &mut us[0]);
        }
        rel = nrm2(&rs[0]) / b_norm;
        if rel <= tol {
            return LinOutcome {
                x, flag: Flag::Converged, iterations: it, residual: rel };
        }
    }
    LinOutcome { x, flag: Flag::MaxIter, iterations: it, residual: rel }
}

/// Solve `A(x) = b` by preconditioned conjugate gradients. The operator must
/// be Hermitian positive-definite for the recurrence to be meaningful.
pub fn pcg<A>(
    op: FlatOp<A>,
    b: &nd::Array1<A>,
    x0: Option<&nd::Array1<A>>,
    m: Option<FlatOp<A>>,
    tol: A::Re,
    maxiter: usize,
) -> LinOutcome<A>
where A: ComplexScalar
{
    let n = b.len();
    let b_norm = nrm2(b);
    let mut x: nd::Array1<A> =
        x0.cloned().unwrap_or_else(|| nd::Array1::zeros(n));
    if b_norm == A::Re::zero() {
        return LinOutcome {
            x: nd::Array1::zeros(n),
            flag: Flag::Converged,
            iterations: 0,
            residual: A::Re::zero(),
        };
    }
    let mut r = b - &op(&x);
    let mut rel = nrm2(&r) / b_norm;
    if rel <= tol {
        return LinOutcome {
            x, flag: Flag::Converged, iterations: 0, residual: rel };
    }
    let mut z = match apply_precond(m, &r) {
        Ok(v) => v,
        Err(flag) => return LinOutcome {
            x, flag, iterations: 0, residual: rel },
    };
    let mut p = z.clone();
    let mut rz = dotc(&r, &z);
    for it in 1..=maxiter {
        let ap = op(&p);
        let pap = dotc(&p, &ap);
        if pap == A::zero() {
            return LinOutcome {
                x, flag: Flag::Stagnated, iterations: it, residual: rel };
        }
        let alpha = rz / pap;
        if !finite(alpha) {
            return LinOutcome {
                x, flag: Flag::ScalarOverflow, iterations: it, residual: rel };
        }
        axpy(alpha, &p, &mut x);
        axpy(-alpha, &ap, &mut r);
        rel = nrm2(&r) / b_norm;
        if rel <= tol {
            return LinOutcome {
                x, flag: Flag::Converged, iterations: it, residual: rel };
        }
        z = match apply_precond(m, &r) {
            Ok(v) => v,
            Err(flag) => return LinOutcome {
                x, flag, iterations: it, residual: rel },
        };
        let rz_new = dotc(&r, &z);
        let beta = rz_new / rz;
        rz = rz_new;
        p.mapv_inplace(|pi| pi * beta);
        p.zip_mut_with(&z, |pi, zi| { *pi = *pi + *zi; });
    }
    LinOutcome { x, flag: Flag::MaxIter, iterations: maxiter, residual: rel }
}

fn both_ends(sorted_asc: Vec<usize>) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::with_capacity(sorted_asc.len());
    let mut lo = 0;
    let mut hi = sorted_asc.len();
    while lo < hi {
        hi -= 1;
        out.push(sorted_asc[hi]);
        if lo < hi {
            out.push(sorted_asc[lo]);
            lo += 1;
        }
    }
    out
}

/// Order eigenvalue indices according to a selector, preferred first.
fn order_indices<A>(vals: &[A], which: Which<A>) -> Vec<usize>
where A: ComplexScalar
{
    use std::cmp::Ordering;
    let cmp_key = |key: &dyn Fn(usize) -> A::Re| {
        let mut idx: Vec<usize> = (0..vals.len()).collect();
        idx.sort_by(|&a, &b| {
            key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal)
        });
        idx
    };
    match which {
        Which::LargestAbs => {
            let mut idx = cmp_key(&|i| ComplexFloat::abs(vals[i]));
            idx.reverse();
            idx
        },
        Which::SmallestAbs => cmp_key(&|i| ComplexFloat::abs(vals[i])),
        Which::LargestReal => {
            let mut idx = cmp_key(&|i| ComplexFloat::re(vals[i]));
            idx.reverse();
            idx
        },
        Which::SmallestReal => cmp_key(&|i| ComplexFloat::re(vals[i])),
        Which::BothEndsReal =>
            both_ends(cmp_key(&|i| ComplexFloat::re(vals[i]))),
        Which::LargestImag => {
            let mut idx = cmp_key(&|i| ComplexFloat::im(vals[i]));
            idx.reverse();
            idx
        },
        Which::SmallestImag => cmp_key(&|i| ComplexFloat::im(vals[i])),
        Which::BothEndsImag =>
            both_ends(cmp_key(&|i| ComplexFloat::im(vals[i]))),
        Which::Shift(s) => cmp_key(&|i| ComplexFloat::abs(vals[i] - s)),
    }
}

/// Find `howmany` eigenpairs of `A` nearest the selector by explicitly
/// restarted Arnoldi iteration.
///
/// `hermitian` switches Ritz extraction to the cheaper Hermitian
/// eigendecomposition of the projected matrix. The subspace dimension is
/// capped at the problem dimension; `maxiter` caps total operator
/// applications. A nonzero flag reports the pairs that failed to converge;
/// the best available Ritz pairs are still returned.
pub fn arnoldi<A>(
    op: FlatOp<A>,
    x0: &nd::Array1<A>,
    howmany: usize,
    which: Which<A>,
    tol: A::Re,
    maxiter: usize,
    krylov_dim: usize,
    hermitian: bool,
) -> EigOutcome<A>
where
    A: ComplexScalar,
    Standard: Distribution<A::Re>,
{
    let n = x0.len();
    let howmany = howmany.max(1).min(n);
    let mm = krylov_dim.max(howmany + 2).min(n);
    let fail = |it| EigOutcome {
        values: Vec::new(),
        vectors: Vec::new(),
        flag: Flag::ScalarOverflow,
        iterations: it,
    };
    let mut rng = rand::thread_rng();
    let mut v0 = {
        let norm = nrm2(x0);
        if norm > A::Re::zero() {
            scaled(x0, A::from_re(A::Re::one() / norm))
        } else {
            random_unit(n, &mut rng)
        }
    };
    let mut iterations: usize = 0;
    loop {
        let mut v: Vec<nd::Array1<A>> = vec![v0.clone()];
        let mut h: nd::Array2<A> = nd::Array2::zeros((mm + 1, mm));
        let mut k_eff = mm;
        let mut invariant = false;
        for k in 0..mm {
            let mut w = op(&v[k]);
            iterations += 1;
            if !all_finite(&w) { return fail(iterations); }
            // modified Gram-Schmidt with one reorthogonalization pass
            for _ in 0..2 {
                for (j, vj) in v.iter().enumerate() {
                    let c = dotc(vj, &w);
                    h[[j, k]] = h[[j, k]] + c;
                    axpy(-c, vj, &mut w);
                }
            }
            let beta = nrm2(&w);
            h[[k + 1, k]] = A::from_re(beta);
            if beta <= A::Re::epsilon() {
                if k + 1 >= howmany {
                    // invariant subspace large enough to answer from
                    k_eff = k + 1;
                    invariant = true;
                    break;
                }
                // inject a fresh random direction orthogonal to the basis
                h[[k + 1, k]] = A::zero();
                let mut f = random_unit(n, &mut rng);
                for vj in v.iter() {
                    let c = dotc(vj, &f);
                    axpy(-c, vj, &mut f);
                }
                let fn_ = nrm2(&f);
                if fn_ == A::Re::zero() { return fail(iterations); }
                v.push(scaled(&f, A::from_re(A::Re::one() / fn_)));
            } else {
                v.push(scaled(&w, A::from_re(A::Re::one() / beta)));
            }
        }
        let hm = h.slice(nd::s![..k_eff, ..k_eff]).to_owned();
        let (theta, yv): (Vec<A>, nd::Array2<A>) = if hermitian {
            match hm.eigh(UPLO::Lower) {
                Ok((vals, vecs)) => {
                    (vals.iter().map(|&r| A::from_re(r)).collect(), vecs)
                },
                Err(_) => return fail(iterations),
            }
        } else {
            match hm.eig() {
                Ok((vals, vecs)) => (vals.to_vec(), vecs),
                Err(_) => return fail(iterations),
            }
        };
        let order = order_indices(&theta, which);
        let wanted: Vec<usize> =
            order.into_iter().take(howmany).collect();
        let beta_last =
            if invariant { A::Re::zero() }
            else { ComplexFloat::abs(h[[k_eff, k_eff - 1]]) };
        let converged = wanted.iter().all(|&i| {
            let resid =
                beta_last * ComplexFloat::abs(yv[[k_eff - 1, i]]);
            let scale = Float::max(
                ComplexFloat::abs(theta[i]), A::Re::one());
            resid <= tol * scale
        });
        if converged || iterations >= maxiter {
            let mut values: Vec<A> = Vec::with_capacity(howmany);
            let mut vectors: Vec<nd::Array1<A>> =
                Vec::with_capacity(howmany);
            for &i in wanted.iter() {
                let mut u: nd::Array1<A> = nd::Array1::zeros(n);
                for (j, vj) in v.iter().take(k_eff).enumerate() {
                    axpy(yv[[j, i]], vj, &mut u);
                }
                let un = nrm2(&u);
                if un > A::Re::zero() {
                    u.mapv_inplace(|z| z * A::from_re(A::Re::one() / un));
                }
                values.push(theta[i]);
                vectors.push(u);
            }
            let flag =
                if converged { Flag::Converged } else { Flag::MaxIter };
            return EigOutcome { values, vectors, flag, iterations };
        }
        // restart from the wanted Ritz directions
        let mut next: nd::Array1<A> = nd::Array1::zeros(n);
        for &i in wanted.iter() {
            for (j, vj) in v.iter().take(k_eff).enumerate() {
                axpy(yv[[j, i]], vj, &mut next);
            }
        }
        let nn = nrm2(&next);
        v0 = if nn > A::Re::zero() {
            scaled(&next, A::from_re(A::Re::one() / nn))
        } else {
            random_unit(n, &mut rng)
        };
    }
}

fn random_unit<A, R>(n: usize, rng: &mut R) -> nd::Array1<A>
where
    A: ComplexScalar,
    R: Rng,
    Standard: Distribution<A::Re>,
{
    let half = A::Re::one() / (A::Re::one() + A::Re::one());
    let v: nd::Array1<A> =
        (0..n)
        .map(|_| {
            let re: A::Re = rng.gen::<A::Re>() - half;
            let im: A::Re = rng.gen::<A::Re>() - half;
            A::from_components(re, im)
        })
        .collect();
    let norm = nrm2(&v);
    scaled(&v, A::from_re(A::Re::one() / norm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64 as C64;

    fn test_system() -> (nd::Array2<C64>, nd::Array1<C64>, nd::Array1<C64>) {
        // diagonally dominant, nonsymmetric
        let n = 8;
        let a = nd::Array2::from_shape_fn((n, n), |(i, j)| {
            if i == j {
                C64::new(4.0 + i as f64, 0.5)
            } else if i + 1 == j {
                C64::new(-1.0, 0.2)
            } else if j + 1 == i {
                C64::new(-0.7, -0.1)
            } else {
                C64::new(0.0, 0.0)
            }
        });
        let x_true = nd::Array1::from_shape_fn(
            n, |i| C64::new(1.0 + 0.3 * i as f64, -0.2 * i as f64));
        let b = a.dot(&x_true);
        (a, b, x_true)
    }

    fn check_outcome(
        a: &nd::Array2<C64>,
        b: &nd::Array1<C64>,
        out: &LinOutcome<C64>,
        tol: f64,
    ) {
        assert_eq!(out.flag, Flag::Converged, "flag: {}", out.flag);
        let r = b - &a.dot(&out.x);
        assert!(
            nrm2(&r) / nrm2(b) <= tol,
            "relative residual {} above {}",
            nrm2(&r) / nrm2(b),
            tol,
        );
    }

    #[test]
    fn gmres_converges() {
        let (a, b, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let out = gmres(&op, &b, None, None, 1e-10, 200, 8);
        check_outcome(&a, &b, &out, 1e-9);
    }

    #[test]
    fn gmres_zero_rhs() {
        let (a, _, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let b = nd::Array1::zeros(8);
        let out = gmres(&op, &b, None, None, 1e-10, 200, 8);
        assert_eq!(out.flag, Flag::Converged);
        assert!(nrm2(&out.x) == 0.0);
    }

    #[test]
    fn gmres_restart_shorter_than_dim() {
        let (a, b, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let out = gmres(&op, &b, None, None, 1e-10, 500, 3);
        check_outcome(&a, &b, &out, 1e-9);
    }

    #[test]
    fn bicgstab_converges() {
        let (a, b, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let out = bicgstab(&op, &b, None, None, 1e-10, 500);
        check_outcome(&a, &b, &out, 1e-8);
    }

    #[test]
    fn bicgstab_jacobi_preconditioned() {
        let (a, b, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let diag: nd::Array1<C64> = a.diag().to_owned();
        let m = move |v: &nd::Array1<C64>| -> nd::Array1<C64> {
            v.iter().zip(&diag).map(|(vi, di)| vi / di).collect()
        };
        let out = bicgstab(&op, &b, None, Some(&m), 1e-10, 500);
        check_outcome(&a, &b, &out, 1e-8);
    }

    #[test]
    fn bicgstabl_converges() {
        let (a, b, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let out = bicgstabl(&op, &b, None, None, 2, 1e-10, 500);
        check_outcome(&a, &b, &out, 1e-8);
    }

    #[test]
    fn pcg_converges_on_hpd() {
        // Hermitian positive-definite system
        let n = 8;
        let a = nd::Array2::from_shape_fn((n, n), |(i, j)| {
            if i == j {
                C64::new(3.0 + i as f64, 0.0)
            } else if i + 1 == j {
                C64::new(-0.5, 0.3)
            } else if j + 1 == i {
                C64::new(-0.5, -0.3)
            } else {
                C64::new(0.0, 0.0)
            }
        });
        let x_true = nd::Array1::from_shape_fn(
            n, |i| C64::new(0.5 * i as f64, 1.0));
        let b = a.dot(&x_true);
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let out = pcg(&op, &b, None, None, 1e-10, 500);
        check_outcome(&a, &b, &out, 1e-8);
    }

    #[test]
    fn max_iter_is_reported_not_raised() {
        let (a, b, _) = test_system();
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let out = gmres(&op, &b, None, None, 1e-14, 2, 2);
        assert_eq!(out.flag, Flag::MaxIter);
        assert_eq!(out.flag.code(), 1);
    }

    #[test]
    fn arnoldi_dominant_pair() {
        let n = 6;
        // hermitian with known dominant eigenpair
        let mut a: nd::Array2<C64> = nd::Array2::zeros((n, n));
        for i in 0..n {
            a[[i, i]] = C64::new(1.0 + i as f64, 0.0);
        }
        a[[0, n - 1]] = C64::new(0.1, 0.0);
        a[[n - 1, 0]] = C64::new(0.1, 0.0);
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let x0 = nd::Array1::from_elem(n, C64::new(1.0, 0.0));
        let out = arnoldi(
            &op, &x0, 1, Which::LargestAbs, 1e-10, 500, 6, false);
        assert_eq!(out.flag, Flag::Converged);
        let lam = out.values[0];
        // exact dominant eigenvalue of the arrow-perturbed diagonal
        assert!((lam.re - 6.002).abs() < 1e-2, "lambda = {lam}");
        let u = &out.vectors[0];
        let resid = &a.dot(u) - &scaled(u, lam);
        assert!(nrm2(&resid) < 1e-8);
    }

    #[test]
    fn arnoldi_hermitian_path() {
        let n = 6;
        let mut a: nd::Array2<C64> = nd::Array2::zeros((n, n));
        for i in 0..n {
            a[[i, i]] = C64::new(i as f64 - 2.0, 0.0);
            if i + 1 < n {
                a[[i, i + 1]] = C64::new(0.2, 0.1);
                a[[i + 1, i]] = C64::new(0.2, -0.1);
            }
        }
        let op = |v: &nd::Array1<C64>| a.dot(v);
        let x0 = nd::Array1::from_elem(n, C64::new(1.0, -0.5));
        let out = arnoldi(
            &op, &x0, 2, Which::SmallestReal, 1e-10, 500, 6, true);
        assert_eq!(out.flag, Flag::Converged);
        assert!(out.values[0].re <= out.values[1].re);
        for (lam, u) in out.values.iter().zip(&out.vectors) {
            let resid = &a.dot(u) - &scaled(u, *lam);
            assert!(nrm2(&resid) < 1e-7, "residual {}", nrm2(&resid));
        }
    }

    #[test]
    fn which_ordering() {
        let vals: Vec<C64> = vec![
            C64::new(1.0, 0.0),
            C64::new(-3.0, 0.0),
            C64::new(2.0, 1.0),
        ];
        assert_eq!(order_indices(&vals, Which::LargestAbs)[0], 1);
        assert_eq!(order_indices(&vals, Which::SmallestAbs)[0], 0);
        assert_eq!(order_indices(&vals, Which::LargestReal)[0], 2);
        assert_eq!(order_indices(&vals, Which::SmallestReal)[0], 1);
        assert_eq!(order_indices(&vals, Which::LargestImag)[0], 2);
        assert_eq!(
            order_indices(&vals, Which::Shift(C64::new(1.1, 0.0)))[0], 0);
        let be = order_indices(&vals, Which::BothEndsReal);
        assert_eq!(be, vec![2, 1, 0]);
    }
}
