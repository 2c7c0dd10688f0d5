fn main() {
    gear_inspector_lib::run()
}
