fn main() {
    mediscope_lib::run()
}
