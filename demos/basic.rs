fn main() {
    let architecture = archspec::cpu::host();

    println!("Current CPU architecture:");
    println!("  Name: {}", architecture.name());
    println!("  Vendor: {}", architecture.vendor());
    println!("  Generation: {}", architecture.generation());
    println!("  Family Name: {}", architecture.family().name());
    println!("  Features: {:?}", architecture.all_features());

    match architecture.optimization_flags("gcc", "12.0") {
        Ok(flags) if flags.is_empty() => println!("  gcc@12.0: no specific flags known"),
        Ok(flags) => println!("  gcc@12.0 flags: {flags}"),
        Err(err) => println!("  gcc@12.0: {err}"),
    }
}
