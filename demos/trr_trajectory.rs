//! This example demonstrates syntax for saving and loading MD trajectories in the GROMACS
//! [TRR](https://manual.gromacs.org/current/reference-manual/file-formats.html#trr) format.

use std::path::Path;

use lin_alg::f64::Vec3;
use trr_files::{OpenMode, Precision, Snapshot, TO_ANGSTROM, TrajectoryFile, TrrFile};

fn main() {
    let path = Path::new("traj.trr");

    // To save a whole trajectory at once:
    let frames: Vec<Snapshot> = (0..10)
        .map(|i| {
            let x = i as f64 * 0.01;
            Snapshot::new(vec![Vec3::new(x, 0., 0.), Vec3::new(0., x, 0.)])
        })
        .collect();

    TrrFile::save(path, Precision::Single, &frames).unwrap();

    // Or, to write frames as they're produced, with velocities, a box, and double precision:
    let mut file = TrrFile::open(path, OpenMode::Write).unwrap();
    file.set_precision(8).unwrap();
    file.set_velocity_storage(true);
    file.set_timestep(0.001);
    file.set_bounding_box(
        Vec3::new(3., 0., 0.),
        Vec3::new(0., 3., 0.),
        Vec3::new(0., 0., 3.),
    );

    let with_vel: Vec<Snapshot> = frames
        .iter()
        .map(|f| Snapshot {
            velocities: vec![Vec3::new(0.1, 0., 0.); f.num_atoms()],
            ..f.clone()
        })
        .collect();

    for frame in &with_vel {
        if !file.append(frame) {
            eprintln!("Problem writing frame");
        }
    }
    // Appends are buffered; closing reports whether they reached the disk.
    file.close().unwrap();

    // Later runs can continue the same file; step numbering picks up where it left off.
    let mut file = TrrFile::open(path, OpenMode::Append).unwrap();
    file.flush_to_disk(&with_vel[..2]).unwrap_or_else(|e| {
        // The frame sequence on disk can't be trusted after this.
        eprintln!("{e}");
    });
    drop(file);

    let traj = TrrFile::load(path).unwrap();
    for frame in &traj {
        println!("Step: {} Time: {:.3} ps", frame.step, frame.time);
        for posit in &frame.positions {
            println!("  {:.3} Å", posit.x * TO_ANGSTROM);
        }
    }

    // You will likely use a similar adapter for your application or library's native snapshot/frame
    // format.
}
