use clap::{Parser, ValueEnum};
use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mm_gpu::{ComputeBackend, HostBackend, MatmulConfig, MatmulContext, MatmulError, Matrix};

/// Largest value drawn for a random matrix element.
const MAX_ELEMENT: f32 = 256.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Metal when built with the `metal` feature on macOS, host otherwise.
    Default,
    Host,
    Metal,
}

/// Multiply two random matrices on the GPU.
#[derive(Parser, Debug)]
#[command(name = "mm-demo")]
struct Args {
    /// Rows of A.
    #[arg(long, default_value_t = 10)]
    a_rows: usize,

    /// Columns of A, which are also the rows of B.
    #[arg(long, default_value_t = 2)]
    inner: usize,

    /// Columns of B.
    #[arg(long, default_value_t = 4)]
    b_cols: usize,

    /// Seed for the random inputs (default: from entropy)
    #[arg(long)]
    seed: Option<u64>,

    /// Print the product only when every dimension is below this.
    #[arg(long, default_value_t = 100)]
    print_limit: usize,

    #[arg(long, value_enum, default_value_t = BackendKind::Default)]
    backend: BackendKind,

    /// Check the product against a scalar reference.
    #[arg(long)]
    verify: bool,
}

fn generate_random_matrix(
    rng: &mut impl Rng,
    rows: usize,
    cols: usize,
) -> Result<Matrix, MatmulError> {
    let data = (0..rows * cols)
        .map(|_| rng.gen_range(0.0..=MAX_ELEMENT))
        .collect();
    Matrix::new(data, rows, cols)
}

fn should_print(args: &Args) -> bool {
    [args.a_rows, args.inner, args.b_cols]
        .iter()
        .all(|&dim| dim < args.print_limit)
}

fn multiply_on<B: ComputeBackend>(
    backend: B,
    args: &Args,
    a: &Matrix,
    b: &Matrix,
) -> Result<(), MatmulError> {
    let ctx = MatmulContext::new(backend, &MatmulConfig::from_env())?;

    println!("performing matrix multiplication");
    let result = ctx.multiply(a, b)?;

    if should_print(args) {
        println!("{}", result);
    } else {
        println!("matmul completed");
    }

    if args.verify {
        let reference = a.reference_matmul(b)?;
        let max_err = result
            .as_slice()
            .iter()
            .zip(reference.as_slice())
            .map(|(g, w)| (g - w).abs() / w.abs().max(1.0))
            .fold(0.0f32, f32::max);
        info!("max relative error vs reference: {:e}", max_err);
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), MatmulError> {
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    println!(
        "generating random arrays for: ({},{}) * ({}, {})",
        args.a_rows, args.inner, args.inner, args.b_cols
    );
    let a = generate_random_matrix(&mut rng, args.a_rows, args.inner)?;
    let b = generate_random_matrix(&mut rng, args.inner, args.b_cols)?;

    match args.backend {
        BackendKind::Default => multiply_on(mm_gpu::default_backend()?, args, &a, &b),
        BackendKind::Host => multiply_on(HostBackend::new(), args, &a, &b),
        BackendKind::Metal => multiply_on(metal_backend()?, args, &a, &b),
    }
}

#[cfg(all(feature = "metal", target_os = "macos"))]
fn metal_backend() -> Result<mm_gpu::MetalBackend, MatmulError> {
    mm_gpu::MetalBackend::system_default()
}

#[cfg(not(all(feature = "metal", target_os = "macos")))]
fn metal_backend() -> Result<HostBackend, MatmulError> {
    error!("built without Metal support; rebuild with --features metal on macOS");
    Err(MatmulError::DeviceUnavailable)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
